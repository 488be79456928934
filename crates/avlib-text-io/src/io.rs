//! Command queue IO task for line-oriented text protocols.
//!
//! One tokio task owns the transport exclusively. Commands are queued
//! without blocking the caller and transmitted one at a time: the task sends
//! a command, waits for its reply line (up to the reply timeout), then holds
//! off for the minimum inter-command delay before sending the next one.
//! Lines that arrive while no command is outstanding, or that carry an
//! unsolicited prefix, are reported as [`QueueEvent::Unsolicited`].
//!
//! Everything the task observes is reported on a single
//! [`mpsc::UnboundedSender<QueueEvent>`], so the driver has exactly one
//! receive path to consume.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use avlib_core::error::{Error, Result};
use avlib_core::transport::Transport;

use crate::protocol::{self, DecodeResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Default minimum gap between the end of one exchange and the next command.
pub const DEFAULT_MIN_COMMAND_DELAY: Duration = Duration::from_millis(25);

/// Default time to wait for a reply line before giving up on a command.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the command queue IO task.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Minimum delay between completing one exchange and sending the next command.
    pub min_command_delay: Duration,
    /// How long to wait for the reply to a single command.
    pub reply_timeout: Duration,
    /// Line prefixes that mark a reply to the outstanding command.
    ///
    /// Empty means "any line that is neither an echo nor unsolicited".
    pub reply_prefixes: &'static [&'static str],
    /// Line prefixes that mark unsolicited feedback (never a reply).
    pub unsolicited_prefixes: &'static [&'static str],
    /// Optional command to send on shutdown (e.g. a session logout).
    pub shutdown_command: Option<&'static [u8]>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_command_delay: DEFAULT_MIN_COMMAND_DELAY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            reply_prefixes: &[],
            unsolicited_prefixes: &[],
            shutdown_command: None,
        }
    }
}

/// A command waiting to be transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    /// Command text. A trailing line feed is optional; one is added on send.
    pub text: String,
    /// Opaque correlation context handed back with every event about this
    /// command, so the consumer knows who asked.
    pub correlation: Option<String>,
}

impl OutboundCommand {
    /// A command with no correlation context.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            correlation: None,
        }
    }

    /// A command whose events carry `correlation` back to the consumer.
    pub fn correlated(text: impl Into<String>, correlation: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            correlation: Some(correlation.into()),
        }
    }

    /// Command text without its line terminator.
    pub fn trimmed(&self) -> &str {
        self.text.trim_end_matches(['\r', '\n'])
    }
}

/// Everything the IO task reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The command was written to the transport.
    Transmitted(OutboundCommand),
    /// The reply line for a transmitted command.
    Response {
        command: OutboundCommand,
        line: String,
    },
    /// No reply arrived within the reply timeout.
    Timeout(OutboundCommand),
    /// The transport refused the command.
    Failed {
        command: OutboundCommand,
        reason: String,
    },
    /// A line that is not the reply to any outstanding command.
    Unsolicited(String),
    /// The IO task has stopped; no further events will follow.
    Closed,
}

/// A request sent from the queue handle to the IO task.
enum Request {
    /// Transmit a command and wait for its reply.
    Command(OutboundCommand),
    /// Graceful shutdown; returns the transport for recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to the IO task.
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Request>,
    /// Cancellation token for abrupt shutdown.
    pub cancel: CancellationToken,
    /// Join handle for the IO task.
    pub task: JoinHandle<()>,
}

impl CommandQueue {
    /// Queue a command for transmission. Never blocks.
    ///
    /// Returns [`Error::NotConnected`] if the IO task has stopped.
    pub fn enqueue(&self, command: OutboundCommand) -> Result<()> {
        self.tx
            .send(Request::Command(command))
            .map_err(|_| Error::NotConnected)
    }

    /// Whether the IO task has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Shut down the IO task and recover the transport.
    ///
    /// Commands queued before the shutdown request are transmitted first.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Shutdown { reply: reply_tx });
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for queueing commands.
///
/// The IO task owns the transport exclusively. Every transmission, reply,
/// timeout and unsolicited line is reported on `event_tx`.
pub fn spawn_command_queue(
    transport: Box<dyn Transport>,
    config: QueueConfig,
    event_tx: mpsc::UnboundedSender<QueueEvent>,
) -> CommandQueue {
    let (tx, rx) = mpsc::unbounded_channel::<Request>();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let task = tokio::spawn(async move {
        io_loop(transport, config, event_tx.clone(), rx, cancel_clone).await;
        let _ = event_tx.send(QueueEvent::Closed);
    });

    CommandQueue { tx, cancel, task }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Maximum buffer size before reset to prevent unbounded growth.
/// Reply lines are rarely longer than a few hundred bytes.
const MAX_BUF: usize = 8192;

/// How long to poll for stragglers before sending after a timed-out command.
const LATE_REPLY_POLL: Duration = Duration::from_millis(5);

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Queued command dispatch
/// 3. Idle unsolicited line reading
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: QueueConfig,
    event_tx: mpsc::UnboundedSender<QueueEvent>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    cancel: CancellationToken,
) {
    let mut rx_buf = Vec::new();
    let mut last_exchange: Option<Instant> = None;
    let mut timed_out = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("command queue cancelled");
                break;
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Shutdown { reply }) => {
                        debug!("command queue shutdown requested");
                        if let Some(cmd) = config.shutdown_command {
                            let _ = transport.send(cmd).await;
                        }
                        let _ = reply.send(transport);
                        return;
                    }
                    Some(Request::Command(command)) => {
                        if let Some(last) = last_exchange {
                            tokio::time::sleep_until(last + config.min_command_delay).await;
                        }
                        if timed_out {
                            discard_late_replies(&mut *transport, &mut rx_buf, &config, &event_tx)
                                .await;
                        }
                        let exchange = execute_command(
                            &mut *transport, command, &config, &mut rx_buf, &event_tx,
                        ).await;
                        last_exchange = Some(Instant::now());
                        timed_out = exchange == Exchange::TimedOut;
                        process_idle_lines(&mut rx_buf, &config, &event_tx);
                        if exchange == Exchange::Stop {
                            break;
                        }
                    }
                    None => {
                        debug!("command channel closed, exiting IO task");
                        break;
                    }
                }
            }

            // Idle: read unsolicited data from the device.
            _ = async {
                let mut buf = [0u8; 512];
                match transport.receive(&mut buf, Duration::from_millis(100)).await {
                    Ok(n) if n > 0 => {
                        rx_buf.extend_from_slice(&buf[..n]);
                        if rx_buf.len() > MAX_BUF {
                            tracing::warn!(len = rx_buf.len(), "idle buffer overflow, resetting");
                            rx_buf.clear();
                            return;
                        }
                        process_idle_lines(&mut rx_buf, &config, &event_tx);
                    }
                    _ => {
                        // Timeout or error -- yield briefly so the loop
                        // can check for commands or cancellation.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// How one command exchange ended.
#[derive(Debug, PartialEq, Eq)]
enum Exchange {
    Finished,
    TimedOut,
    /// The transport is gone and the IO loop should stop.
    Stop,
}

/// How one received line relates to the outstanding command.
#[derive(Debug, PartialEq, Eq)]
enum LineKind {
    Reply,
    Echo,
    Unsolicited,
    Blank,
}

fn classify(line: &str, command: Option<&OutboundCommand>, config: &QueueConfig) -> LineKind {
    if line.trim().is_empty() {
        return LineKind::Blank;
    }
    if config
        .unsolicited_prefixes
        .iter()
        .any(|p| line.starts_with(p))
    {
        return LineKind::Unsolicited;
    }
    let Some(command) = command else {
        return LineKind::Unsolicited;
    };
    if protocol::is_echo(line, &command.text) {
        return LineKind::Echo;
    }
    if is_reply_line(line, config) {
        LineKind::Reply
    } else {
        LineKind::Unsolicited
    }
}

fn is_reply_line(line: &str, config: &QueueConfig) -> bool {
    config.reply_prefixes.is_empty() || config.reply_prefixes.iter().any(|p| line.starts_with(p))
}

/// Transmit one command and wait for its reply.
async fn execute_command(
    transport: &mut dyn Transport,
    command: OutboundCommand,
    config: &QueueConfig,
    rx_buf: &mut Vec<u8>,
    event_tx: &mpsc::UnboundedSender<QueueEvent>,
) -> Exchange {
    let bytes = protocol::encode_command(&command.text);
    tracing::trace!(command = %command.trimmed(), "transmitting");

    if let Err(e) = transport.send(&bytes).await {
        tracing::warn!(command = %command.trimmed(), error = %e, "command send failed");
        let fatal = matches!(e, Error::NotConnected | Error::ConnectionLost);
        let _ = event_tx.send(QueueEvent::Failed {
            command,
            reason: e.to_string(),
        });
        return if fatal { Exchange::Stop } else { Exchange::Finished };
    }
    let _ = event_tx.send(QueueEvent::Transmitted(command.clone()));

    let deadline = Instant::now() + config.reply_timeout;
    let mut recv_buf = [0u8; 512];

    loop {
        // Lines already buffered (e.g. left over from an idle read) count too.
        loop {
            match protocol::decode_line(rx_buf) {
                DecodeResult::Line { text, consumed } => {
                    rx_buf.drain(..consumed);
                    match classify(&text, Some(&command), config) {
                        LineKind::Reply => {
                            tracing::trace!(line = %text, "reply received");
                            let _ = event_tx.send(QueueEvent::Response {
                                command,
                                line: text,
                            });
                            return Exchange::Finished;
                        }
                        LineKind::Echo => {
                            tracing::trace!(line = %text, "skipping command echo");
                        }
                        LineKind::Unsolicited => {
                            let _ = event_tx.send(QueueEvent::Unsolicited(text));
                        }
                        LineKind::Blank => {}
                    }
                }
                DecodeResult::Invalid(consumed) => {
                    rx_buf.drain(..consumed);
                    debug!("discarding non-UTF-8 line");
                }
                DecodeResult::Incomplete => break,
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }

        match transport.receive(&mut recv_buf, deadline - now).await {
            Ok(n) => {
                rx_buf.extend_from_slice(&recv_buf[..n]);
                if rx_buf.len() > MAX_BUF {
                    tracing::warn!(len = rx_buf.len(), "response buffer overflow, clearing");
                    rx_buf.clear();
                }
            }
            Err(Error::Timeout) => break,
            Err(e) => {
                tracing::warn!(error = %e, "receive failed while awaiting reply");
                let fatal = matches!(e, Error::NotConnected | Error::ConnectionLost);
                let _ = event_tx.send(QueueEvent::Failed {
                    command,
                    reason: e.to_string(),
                });
                return if fatal { Exchange::Stop } else { Exchange::Finished };
            }
        }
    }

    debug!(command = %command.trimmed(), "reply timed out");
    let _ = event_tx.send(QueueEvent::Timeout(command));
    Exchange::TimedOut
}

/// Drop reply lines that are already waiting before the next command goes
/// out, so a reply to a timed-out command is not taken as the next reply.
///
/// Only data that has arrived by the end of a short poll is seen; a reply
/// later than that can still be misattributed.
async fn discard_late_replies(
    transport: &mut dyn Transport,
    rx_buf: &mut Vec<u8>,
    config: &QueueConfig,
    event_tx: &mpsc::UnboundedSender<QueueEvent>,
) {
    let mut recv_buf = [0u8; 512];
    while let Ok(n) = transport.receive(&mut recv_buf, LATE_REPLY_POLL).await {
        if n == 0 {
            break;
        }
        rx_buf.extend_from_slice(&recv_buf[..n]);
        if rx_buf.len() > MAX_BUF {
            tracing::warn!(len = rx_buf.len(), "buffer overflow while draining, clearing");
            rx_buf.clear();
            return;
        }
    }

    loop {
        match protocol::decode_line(rx_buf) {
            DecodeResult::Line { text, consumed } => {
                rx_buf.drain(..consumed);
                match classify(&text, None, config) {
                    LineKind::Blank => {}
                    _ if !config.unsolicited_prefixes.iter().any(|p| text.starts_with(p))
                        && is_reply_line(&text, config) =>
                    {
                        debug!(line = %text, "discarding late reply");
                    }
                    _ => {
                        let _ = event_tx.send(QueueEvent::Unsolicited(text));
                    }
                }
            }
            DecodeResult::Invalid(consumed) => {
                rx_buf.drain(..consumed);
                debug!("discarding non-UTF-8 line");
            }
            DecodeResult::Incomplete => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Idle line processing
// ---------------------------------------------------------------------------

/// Report every complete line in the buffer as unsolicited.
///
/// Incomplete data is left in the buffer for the next read cycle.
fn process_idle_lines(
    buf: &mut Vec<u8>,
    config: &QueueConfig,
    event_tx: &mpsc::UnboundedSender<QueueEvent>,
) {
    loop {
        match protocol::decode_line(buf) {
            DecodeResult::Line { text, consumed } => {
                buf.drain(..consumed);
                if classify(&text, None, config) != LineKind::Blank {
                    let _ = event_tx.send(QueueEvent::Unsolicited(text));
                }
            }
            DecodeResult::Invalid(consumed) => {
                buf.drain(..consumed);
                debug!("discarding non-UTF-8 line in idle read");
            }
            DecodeResult::Incomplete => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
