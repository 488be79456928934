//! Device handle and receive path.
//!
//! [`Dsp`] is the shared context every block on one Tesira server talks
//! through: the command sink that feeds the queue, the correlation
//! registry, the initialization signal, and the device event broadcast.
//!
//! The receive path is [`Dsp::handle_queue_event`]. When the device is built
//! with [`crate::DspBuilder::build_with_transport`], a tokio task feeds it
//! every [`QueueEvent`] from the command queue.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use avlib_core::error::Result;
use avlib_core::events::DeviceEvent;
use avlib_text_io::{CommandQueue, OutboundCommand, QueueEvent};

use crate::code::Code;
use crate::registry::{locked, Dispatch, FeedbackCallback, Registry};
use crate::response::Response;
use crate::value::Value;

/// Default capacity of the device event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Where serialized codes go. Implemented by the command queue.
pub trait CommandSink: Send + Sync {
    /// Queue a command for transmission. Must not block.
    fn enqueue(&self, command: OutboundCommand) -> Result<()>;
}

impl CommandSink for CommandQueue {
    fn enqueue(&self, command: OutboundCommand) -> Result<()> {
        CommandQueue::enqueue(self, command)
    }
}

/// Notified when the device becomes initialized.
pub(crate) trait InitializeListener: Send + Sync {
    fn device_initialized(&self);
}

/// Options for a [`Dsp`] that do not concern the command queue.
#[derive(Debug, Clone)]
pub struct DspOptions {
    /// Mark the device initialized when the welcome banner arrives.
    pub initialize_on_banner: bool,
    /// Capacity of the [`DeviceEvent`] broadcast.
    pub event_capacity: usize,
}

impl Default for DspOptions {
    fn default() -> Self {
        Self {
            initialize_on_banner: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Handle to one Tesira server. Cheap to clone.
#[derive(Clone)]
pub struct Dsp {
    shared: Arc<DspShared>,
}

struct DspShared {
    sink: Arc<dyn CommandSink>,
    registry: Registry,
    initialized: watch::Sender<bool>,
    listeners: Mutex<Vec<Weak<dyn InitializeListener>>>,
    events: broadcast::Sender<DeviceEvent>,
    initialize_on_banner: bool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Dsp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsp")
            .field("initialized", &self.is_initialized())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

impl Dsp {
    /// A device writing to `sink`, with default options.
    ///
    /// No receive task is started; replies must be fed to
    /// [`Dsp::handle_queue_event`] by the caller.
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self::with_options(sink, DspOptions::default())
    }

    pub fn with_options(sink: Arc<dyn CommandSink>, options: DspOptions) -> Self {
        let (initialized, _) = watch::channel(false);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            shared: Arc::new(DspShared {
                sink,
                registry: Registry::new(),
                initialized,
                listeners: Mutex::new(Vec::new()),
                events,
                initialize_on_banner: options.initialize_on_banner,
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn is_initialized(&self) -> bool {
        *self.shared.initialized.borrow()
    }

    /// Set the initialization flag.
    ///
    /// A false-to-true transition notifies every live attribute node, which
    /// then issues its Gets and Subscribes. Setting the current value again
    /// does nothing.
    pub fn set_initialized(&self, initialized: bool) {
        let changed = self.shared.initialized.send_if_modified(|state| {
            if *state == initialized {
                false
            } else {
                *state = initialized;
                true
            }
        });
        if !changed {
            return;
        }

        if initialized {
            debug!("device initialized");
            let _ = self.shared.events.send(DeviceEvent::Initialized);
            for listener in self.live_listeners() {
                listener.device_initialized();
            }
        } else {
            debug!("device deinitialized");
            let _ = self.shared.events.send(DeviceEvent::Deinitialized);
        }
    }

    /// Watch the initialization flag.
    pub fn initialized_watch(&self) -> watch::Receiver<bool> {
        self.shared.initialized.subscribe()
    }

    /// Subscribe to device-level events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Queue `code` without registering a callback.
    pub fn send(&self, code: &Code) -> Result<()> {
        let command = OutboundCommand::correlated(code.serialize(), code.key());
        trace!(command = %command.trimmed(), "queueing");
        self.shared.sink.enqueue(command)
    }

    /// Register `callback` under the key of `code`, then queue the code.
    ///
    /// Returns the correlation key.
    pub fn request(&self, code: &Code, callback: FeedbackCallback) -> Result<String> {
        let key = code.key();
        self.shared.registry.register(key.clone(), callback);
        self.send(code)?;
        Ok(key)
    }

    /// Stop the command queue, if this device owns one.
    ///
    /// The queue reports `Closed`, which marks the device uninitialized.
    pub fn close(&self) {
        if let Some(cancel) = locked(&self.shared.cancel).take() {
            debug!("closing command queue");
            cancel.cancel();
        }
    }

    pub(crate) fn add_listener(&self, listener: Weak<dyn InitializeListener>) {
        let mut listeners = locked(&self.shared.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Weak<dyn InitializeListener>) {
        locked(&self.shared.listeners).retain(|l| l.strong_count() > 0 && !l.ptr_eq(listener));
    }

    fn live_listeners(&self) -> Vec<Arc<dyn InitializeListener>> {
        let mut listeners = locked(&self.shared.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn set_cancel(&self, cancel: CancellationToken) {
        *locked(&self.shared.cancel) = Some(cancel);
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Process one event from the command queue.
    pub fn handle_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Transmitted(command) => {
                trace!(command = %command.trimmed(), "transmitted");
            }
            QueueEvent::Response { command, line } => self.handle_line(&line, Some(&command)),
            QueueEvent::Unsolicited(line) => self.handle_line(&line, None),
            QueueEvent::Timeout(command) => {
                debug!(command = %command.trimmed(), "no reply before timeout");
                let _ = self.shared.events.send(DeviceEvent::CommandTimedOut {
                    command: command.trimmed().to_string(),
                });
            }
            QueueEvent::Failed { command, reason } => {
                warn!(command = %command.trimmed(), reason = %reason, "command failed");
            }
            QueueEvent::Closed => {
                debug!("command queue closed");
                self.set_initialized(false);
            }
        }
    }

    /// Process one line, optionally the reply to `command`.
    fn handle_line(&self, line: &str, command: Option<&OutboundCommand>) {
        let response = match Response::parse(line) {
            Ok(response) => response,
            Err(e) => {
                warn!(line = %line, error = %e, "discarding malformed line");
                return;
            }
        };

        match response {
            Response::Ok(None) => trace!("acknowledged"),
            Response::Ok(Some(record)) => {
                match command.and_then(|c| c.correlation.as_deref()) {
                    Some(key) => self.dispatch(key, &record),
                    None => trace!(line = %line, "reply without correlation"),
                }
            }
            Response::Publish { token, record } => self.dispatch(&token, &record),
            Response::Error(message) => {
                let command = command.map(|c| c.trimmed().to_string()).unwrap_or_default();
                warn!(command = %command, message = %message, "device error");
                let _ = self
                    .shared
                    .events
                    .send(DeviceEvent::DeviceError { command, message });
            }
            other if other.is_banner() => {
                debug!("welcome banner");
                if self.shared.initialize_on_banner {
                    self.set_initialized(true);
                }
            }
            Response::Other(text) => trace!(line = %text, "ignoring line"),
        }
    }

    fn dispatch(&self, key: &str, record: &Value) {
        match self.shared.registry.dispatch(key, record) {
            Dispatch::Delivered => trace!(key = %key, "feedback delivered"),
            Dispatch::Unclaimed => {}
            Dispatch::Failed(e) => warn!(key = %key, error = %e, "feedback rejected"),
        }
    }

    fn downgrade(&self) -> Weak<DspShared> {
        Arc::downgrade(&self.shared)
    }
}

/// Spawn the task that feeds queue events into `dsp`.
///
/// The task holds the device weakly and ends when the queue closes or the
/// last [`Dsp`] handle is dropped.
pub(crate) fn spawn_receive_task(
    dsp: &Dsp,
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
) -> JoinHandle<()> {
    let shared = dsp.downgrade();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let closed = matches!(event, QueueEvent::Closed);
            Dsp { shared }.handle_queue_event(event);
            if closed {
                break;
            }
        }
        trace!("receive task exiting");
    })
}
