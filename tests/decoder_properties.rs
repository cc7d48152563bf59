//! Structural properties of the frame decoder.

use power_monitor::measurement_types::CalibrationTarget;
use power_monitor::protocol::frame::{decode_line, is_json_bearing};
use power_monitor::protocol::{DecodeError, Decoded, Frame};

const VALID_FRAMES: [&str; 3] = [
    r#"{"type":"data","voltage":229.8,"current":4.75}"#,
    r#"{"type":"coefficients","voltage":1,"current":1.05,"powerFactor":0.98}"#,
    r#"{"type":"info","version":"1.4.2","date":"Mar  5 2024 12:34:56"}"#,
];

#[test]
fn valid_frames_decode_with_surrounding_whitespace() {
    for frame in VALID_FRAMES {
        for raw in [
            frame.to_string(),
            format!("{frame}\r"),
            format!("  {frame}  "),
        ] {
            assert!(
                matches!(decode_line(&raw), Decoded::Frame(_)),
                "{raw:?} should decode"
            );
        }
    }
}

#[test]
fn missing_brace_at_either_end_is_noise() {
    for frame in VALID_FRAMES {
        let without_open = &frame[1..];
        let without_close = &frame[..frame.len() - 1];
        assert!(matches!(decode_line(without_open), Decoded::Noise));
        assert!(matches!(decode_line(without_close), Decoded::Noise));
    }
}

#[test]
fn odd_quote_count_is_noise() {
    for frame in VALID_FRAMES {
        // Drop the first quote character.
        let pos = frame.find('"').unwrap();
        let mut broken = frame.to_string();
        broken.remove(pos);
        assert!(!is_json_bearing(&broken));
        assert!(matches!(decode_line(&broken), Decoded::Noise));
    }
}

#[test]
fn structurally_valid_garbage_is_an_error_not_noise() {
    for raw in [
        "{garbage}",
        r#"{"type":"data",}"#,
        r#"{"type":"data","voltage":"high","current":1}"#,
        r#"{"type":42}"#,
    ] {
        assert!(
            matches!(decode_line(raw), Decoded::Error(_)),
            "{raw:?} should be a decode error"
        );
    }
}

#[test]
fn unknown_type_is_explicit() {
    assert!(matches!(
        decode_line(r#"{"type":"telemetry","uptime":5}"#),
        Decoded::Error(DecodeError::UnknownType(Some(_)))
    ));
}

#[test]
fn coefficient_fields_map_by_name() {
    match decode_line(VALID_FRAMES[1]) {
        Decoded::Frame(Frame::Coefficients(target)) => {
            assert_eq!(target, CalibrationTarget::new(1.0, 1.05, 0.98));
        }
        other => panic!("unexpected {other:?}"),
    }
}
