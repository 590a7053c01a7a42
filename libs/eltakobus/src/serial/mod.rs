//! Serial Transport
//!
//! [`SerialBus`] drives the bus over an RS485 adapter (or any byte stream).
//! A spawned receive loop reassembles telegrams, swallows our own echo and
//! hands each remaining telegram either to the single pending exchange or to
//! the unsolicited queue.
//!
//! The adapter has to drive the bus only while sending, which the common
//! USB-RS485 converters do on their own.

mod codec;
mod echo;

pub use codec::TelegramCodec;
pub use echo::{detect_echo, EchoFilter, ECHO_PROBE};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusInterface, Expect, ReceivedQueue};
use crate::config::{EchoMode, SerialConfig};
use crate::error::{BusError, Result};
use crate::message::{hex_string, EltakoTimeout, Esp2Message, Message, TELEGRAM_LEN};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The exchange currently waiting for its reply
struct PendingExchange {
    id: u64,
    expect: Expect,
    reply: oneshot::Sender<Esp2Message>,
}

/// State shared between callers and the receive loop
#[derive(Default)]
struct ExchangeState {
    pending: Option<PendingExchange>,
    echo: Option<EchoFilter>,
    closed: bool,
}

/// Clears the pending slot when an exchange ends, including by cancellation
struct PendingGuard<'a> {
    state: &'a Mutex<ExchangeState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == self.id) {
            state.pending = None;
        }
    }
}

/// Bus interface over a serial line
pub struct SerialBus {
    state: Arc<Mutex<ExchangeState>>,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, TelegramCodec>>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<Esp2Message>>,
    next_id: AtomicU64,
    exchange_timeout: Duration,
    receive_task: JoinHandle<()>,
}

impl SerialBus {
    /// Open the configured serial port (8N1) and start the transport on it
    pub async fn open(config: &SerialConfig) -> Result<Self> {
        config.validate()?;
        debug!("Opening serial port: {}", config.port);

        let port = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                BusError::connection(format!("Failed to open serial port {}: {e}", config.port))
            })?;
        info!("Successfully opened serial port: {}", config.port);

        let (reader, writer) = tokio::io::split(port);
        Self::start(reader, writer, config).await
    }

    /// Start the transport on an arbitrary byte stream
    ///
    /// Runs echo calibration first when the config asks for it.
    pub async fn start<R, W>(mut reader: R, mut writer: W, config: &SerialConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let echoes = match config.echo {
            EchoMode::Enabled => true,
            EchoMode::Disabled => false,
            EchoMode::Auto => {
                detect_echo(
                    &mut reader,
                    &mut writer,
                    config.calibration_timeout(),
                    config.calibration_attempts,
                )
                .await?
            },
        };
        info!(echo_suppression = echoes, "Serial transport started");

        let state = Arc::new(Mutex::new(ExchangeState {
            echo: echoes.then(|| EchoFilter::new(config.echo_grace())),
            ..Default::default()
        }));
        let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();

        let frames = FramedRead::new(reader, TelegramCodec::new());
        let receive_task = tokio::spawn(receive_loop(frames, Arc::clone(&state), unsolicited_tx));

        Ok(Self {
            state,
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                Box::new(writer) as BoxedWriter,
                TelegramCodec::new(),
            )),
            received: tokio::sync::Mutex::new(unsolicited_rx),
            next_id: AtomicU64::new(0),
            exchange_timeout: config.exchange_timeout(),
            receive_task,
        })
    }

    /// Whether sent telegrams are expected back as echo
    pub fn echo_suppression(&self) -> bool {
        self.state.lock().echo.is_some()
    }

    /// Whether the receive loop has ended
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn write(&self, message: &Esp2Message) -> Result<()> {
        let frame = message.serialize();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BusError::connection("serial line is closed"));
            }
            if let Some(echo) = state.echo.as_mut() {
                echo.record(frame);
            }
        }

        debug!(hex_data = %hex_string(&frame), length = TELEGRAM_LEN, direction = "send", "[Serial Bus] Telegram");
        self.writer.lock().await.send(*message).await
    }
}

impl Drop for SerialBus {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

#[async_trait]
impl BusInterface for SerialBus {
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BusError::connection("serial line is closed"));
            }
            if state.pending.is_some() {
                return Err(BusError::Busy);
            }
            state.pending = Some(PendingExchange {
                id,
                expect,
                reply: reply_tx,
            });
        }
        let _pending = PendingGuard {
            state: &self.state,
            id,
        };

        self.write(request).await?;

        match tokio::time::timeout(self.exchange_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::connection("serial line closed during exchange")),
            Err(_) if expect.expiry_is_reply() => Ok(EltakoTimeout.to_esp2()),
            Err(_) => Err(BusError::timeout(format!(
                "no {} within {:?}",
                expect.name(),
                self.exchange_timeout
            ))),
        }
    }

    /// Write only; any answer shows up on the unsolicited queue
    async fn send(&self, request: &Esp2Message) -> Result<()> {
        self.write(request).await
    }
}

#[async_trait]
impl ReceivedQueue for SerialBus {
    fn try_recv(&self) -> Option<Esp2Message> {
        self.received.try_lock().ok()?.try_recv().ok()
    }

    async fn recv(&self) -> Option<Esp2Message> {
        self.received.lock().await.recv().await
    }
}

async fn receive_loop<R>(
    mut frames: FramedRead<R, TelegramCodec>,
    state: Arc<Mutex<ExchangeState>>,
    unsolicited: mpsc::UnboundedSender<Esp2Message>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Serial line failed");
                break;
            },
        };
        debug!(hex_data = %hex_string(&message.serialize()), length = TELEGRAM_LEN, direction = "recv", "[Serial Bus] Telegram");

        if let Some(message) = dispatch(&state, message) {
            if unsolicited.send(message).is_err() {
                break;
            }
        }
    }

    let skipped = frames.decoder().skipped();
    if skipped > 0 {
        debug!(skipped, "Bytes dropped while resynchronizing");
    }
    info!("Serial receive loop ended");

    let mut state = state.lock();
    state.closed = true;
    state.pending = None;
}

/// Route one inbound telegram; returns it when it belongs on the unsolicited queue
fn dispatch(state: &Mutex<ExchangeState>, message: Esp2Message) -> Option<Esp2Message> {
    let mut state = state.lock();

    if let Some(echo) = state.echo.as_mut() {
        if echo.suppress(&message) {
            trace!("Suppressed echo of our own telegram");
            return None;
        }
    }

    let resolves = state
        .pending
        .as_ref()
        .is_some_and(|pending| pending.expect.resolves(&message));
    if !resolves {
        return Some(message);
    }

    let pending = state.pending.take()?;
    match pending.reply.send(message) {
        Ok(()) => None,
        // caller gave up in the meantime
        Err(message) => Some(message),
    }
}
