//! Serial line transport.
//!
//! [`SerialTransport`] owns one bidirectional byte stream to the meter. Bytes
//! are split on `\n` and decoded lossily as UTF-8, so garbage in a boot banner
//! turns into a noise line rather than a read error. Each line (delimiter
//! stripped, any `\r` kept) goes to the `mpsc::Sender<String>` given at open.
//!
//! There is no reconnection: after a read or write error the link stays down
//! until `open`/`attach` is called again.
//!
//! Any `AsyncRead + AsyncWrite` stream can be attached, which is how tests
//! drive the transport through `tokio::io::duplex`.

use crate::error::AppResult;
#[cfg(not(feature = "serial"))]
use crate::error::MonitorError;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Outbound half of the device connection, as the protocol layer sees it.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Write a raw command. A silent no-op when the link is not open; write
    /// errors are logged and close the link.
    async fn write(&self, raw: &str);

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;
}

struct Shared {
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    opened: watch::Sender<bool>,
    generation: AtomicU64,
    label: SyncMutex<String>,
}

impl Shared {
    /// Tear down the writer if `generation` is still the live connection.
    async fn link_down(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().await.take();
        self.opened.send_replace(false);
    }
}

/// The physical link to the meter.
pub struct SerialTransport {
    shared: Arc<Shared>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport {
    /// A closed transport.
    pub fn new() -> Self {
        let (opened, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(None),
                opened,
                generation: AtomicU64::new(0),
                label: SyncMutex::new(String::new()),
            }),
            reader: SyncMutex::new(None),
        }
    }

    /// Open a real serial port (8N1, no flow control) and start reading.
    #[cfg(feature = "serial")]
    pub async fn open(
        &self,
        port: &str,
        baud_rate: u32,
        on_line: mpsc::Sender<String>,
    ) -> AppResult<()> {
        let stream = open_serial_async(port, baud_rate).await?;
        self.attach(Box::new(stream), port, on_line).await;
        Ok(())
    }

    /// Serial hardware support is compiled out.
    #[cfg(not(feature = "serial"))]
    pub async fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        _on_line: mpsc::Sender<String>,
    ) -> AppResult<()> {
        error!("Cannot open {port}: serial support not compiled in");
        Err(MonitorError::SerialFeatureDisabled)
    }

    /// Use an already-open stream as the device link.
    ///
    /// Any previous connection is closed first. Fires the opened signal.
    pub async fn attach(&self, stream: DynSerial, label: &str, on_line: mpsc::Sender<String>) {
        self.close().await;

        let (read_half, write_half) = tokio::io::split(stream);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.writer.lock().await = Some(write_half);
        *self.shared.label.lock() = label.to_string();
        // Open before the reader runs, so an immediate EOF leaves the link down.
        self.shared.opened.send_replace(true);

        let handle = tokio::spawn(read_lines(
            read_half,
            on_line,
            Arc::clone(&self.shared),
            generation,
            label.to_string(),
        ));
        *self.reader.lock() = Some(handle);
        info!("Serial link open on {label}");
    }

    /// Resolve once the link is open (immediately if it already is).
    pub async fn wait_opened(&self) {
        let mut opened = self.shared.opened.subscribe();
        // The sender lives in `self`, so this only ends when the link opens.
        let _ = opened.wait_for(|open| *open).await;
    }

    /// Stop reading and drop the writer. Idempotent.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // Invalidate the old reader's cleanup before touching the writer.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!("Error shutting down serial writer: {err}");
            }
        }

        if self.shared.opened.send_replace(false) {
            info!("Serial link on {} closed", self.shared.label.lock());
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl DeviceLink for SerialTransport {
    async fn write(&self, raw: &str) {
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("Serial link not open; dropping write of {} bytes", raw.len());
            return;
        };

        let result: std::io::Result<()> = async {
            writer.write_all(raw.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            error!("Serial write failed: {err}; link is down");
            guard.take();
            drop(guard);
            self.shared.opened.send_replace(false);
        }
    }

    fn is_open(&self) -> bool {
        *self.shared.opened.borrow()
    }
}

async fn read_lines(
    read_half: ReadHalf<DynSerial>,
    on_line: mpsc::Sender<String>,
    shared: Arc<Shared>,
    generation: u64,
    label: String,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                warn!("Serial link {label} reached end of stream");
                break;
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if on_line.send(line).await.is_err() {
                    debug!("Line consumer gone; stopping reader for {label}");
                    break;
                }
            }
            Err(err) => {
                error!("Serial read error on {label}: {err}");
                break;
            }
        }
    }

    shared.link_down(generation).await;
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use crate::error::MonitorError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                MonitorError::Serial(format!("Failed to open serial port {port_path_owned}: {e}"))
            })
    })
    .await
    .map_err(|e| MonitorError::Serial(format!("spawn_blocking for serial port opening failed: {e}")))?
}
