//! Fluent builder for a [`Dsp`] connected to a command queue.
//!
//! ```no_run
//! # async fn example(transport: Box<dyn avlib_core::Transport>) -> avlib_core::Result<()> {
//! use std::time::Duration;
//! use avlib_tesira::{DspBuilder, LevelBlock};
//!
//! let dsp = DspBuilder::new()
//!     .min_command_delay(Duration::from_millis(50))
//!     .reply_timeout(Duration::from_secs(2))
//!     .build_with_transport(transport)
//!     .await?;
//!
//! let program = LevelBlock::new(&dsp, "Program");
//! program.channel(1)?.set_level(-10.0)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use avlib_core::error::{Error, Result};
use avlib_core::transport::Transport;
use avlib_text_io::{spawn_command_queue, QueueConfig};

use crate::device::{spawn_receive_task, CommandSink, Dsp, DspOptions};

/// Replies start with `+OK` or `-ERR`/`-CANNOT_DELIVER`/...
const REPLY_PREFIXES: &[&str] = &["+", "-"];

/// Subscription feedback starts with `!`.
const PUBLISH_PREFIXES: &[&str] = &["!"];

/// Builder for [`Dsp`].
#[derive(Debug, Clone)]
pub struct DspBuilder {
    queue: QueueConfig,
    options: DspOptions,
}

impl DspBuilder {
    pub fn new() -> Self {
        Self {
            queue: QueueConfig {
                reply_prefixes: REPLY_PREFIXES,
                unsolicited_prefixes: PUBLISH_PREFIXES,
                ..QueueConfig::default()
            },
            options: DspOptions::default(),
        }
    }

    /// Minimum gap between one exchange finishing and the next command.
    pub fn min_command_delay(mut self, delay: Duration) -> Self {
        self.queue.min_command_delay = delay;
        self
    }

    /// How long to wait for each reply before reporting a timeout.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.queue.reply_timeout = timeout;
        self
    }

    /// Whether the welcome banner marks the device initialized (default on).
    ///
    /// Turn this off when the session needs a login or other setup first,
    /// then call [`Dsp::set_initialized`] yourself.
    pub fn initialize_on_banner(mut self, enabled: bool) -> Self {
        self.options.initialize_on_banner = enabled;
        self
    }

    /// Capacity of the device event broadcast.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.options.event_capacity == 0 {
            return Err(Error::InvalidParameter(
                "event capacity must be at least 1".into(),
            ));
        }
        if self.queue.reply_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "reply timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Spawn the command queue on `transport` and the receive task feeding
    /// the device on the current runtime.
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<Dsp> {
        self.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let queue = spawn_command_queue(transport, self.queue, event_tx);
        let cancel = queue.cancel.clone();

        let dsp = Dsp::with_options(Arc::new(queue), self.options);
        dsp.set_cancel(cancel);
        spawn_receive_task(&dsp, event_rx);
        Ok(dsp)
    }

    /// A device writing to a caller-supplied sink, with no receive task.
    pub fn build_with_sink(self, sink: Arc<dyn CommandSink>) -> Result<Dsp> {
        self.validate()?;
        Ok(Dsp::with_options(sink, self.options))
    }
}

impl Default for DspBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::LevelBlock;
    use crate::value::Value;
    use avlib_core::events::DeviceEvent;
    use avlib_test_harness::MockTransport;

    const BANNER: &[u8] = b"Welcome to the Tesira Text Protocol Server...\r\n";

    fn fast() -> DspBuilder {
        DspBuilder::new()
            .min_command_delay(Duration::from_millis(1))
            .reply_timeout(Duration::from_millis(50))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn builder_defaults() {
        let builder = DspBuilder::new();
        assert_eq!(builder.queue.min_command_delay, Duration::from_millis(25));
        assert_eq!(builder.queue.reply_timeout, Duration::from_secs(1));
        assert_eq!(builder.queue.reply_prefixes, REPLY_PREFIXES);
        assert!(builder.options.initialize_on_banner);
    }

    #[test]
    fn builder_rejects_zero_capacity() {
        let sink = Arc::new(crate::device::tests::RecordingSink::default());
        let result = DspBuilder::new().event_capacity(0).build_with_sink(sink);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn build_with_transport_validates_first() {
        let result = DspBuilder::new()
            .reply_timeout(Duration::ZERO)
            .build_with_transport(Box::new(MockTransport::lenient()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn banner_initializes_blocks_over_transport() {
        let mut mock = MockTransport::lenient();
        mock.push_unsolicited(BANNER);
        mock.expect(b"Level1 get numChannels\n", b"+OK \"value\":1\r\n");
        mock.expect(b"Level1 get ganged\n", b"+OK \"value\":true\r\n");
        mock.expect(
            b"Level1 get level 1\n",
            b"+OK \"value\":-6.000000\r\n",
        );
        let log = mock.sent_log();

        let dsp = fast().build_with_transport(Box::new(mock)).await.unwrap();
        let block = LevelBlock::new(&dsp, "Level1");

        wait_for(|| dsp.is_initialized()).await;
        wait_for(|| block.channel_count() == Some(1)).await;
        assert_eq!(block.ganged(), Some(true));

        let channel = block.channel(1).unwrap();
        wait_for(|| channel.level() == Some(-6.0)).await;
        wait_for(|| {
            log.lines()
                .contains(&"Level1 subscribe level 1 Level1-level-1\n".to_string())
        })
        .await;
        dsp.close();
    }

    #[tokio::test]
    async fn publish_feedback_over_transport() {
        let mut mock = MockTransport::lenient();
        mock.push_unsolicited(BANNER);
        mock.push_unsolicited(b"! \"publishToken\":\"Level1-mute-2\" \"value\":true\r\n");

        let dsp = fast()
            .initialize_on_banner(false)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();
        dsp.set_initialized(true);
        let block = LevelBlock::new(&dsp, "Level1");
        let channel = block.channel(2).unwrap();
        let mut changes = block.changes();

        let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.attribute, "mute");
        assert_eq!(change.indices, vec![2]);
        assert_eq!(change.value, Value::from(true));
        assert_eq!(channel.mute(), Some(true));
        dsp.close();
    }

    #[tokio::test]
    async fn reply_timeout_is_reported() {
        let mock = MockTransport::lenient();
        let dsp = fast().build_with_transport(Box::new(mock)).await.unwrap();
        let mut events = dsp.subscribe_events();

        crate::blocks::DeviceService::new(&dsp)
            .recall_preset(1001)
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DeviceEvent::CommandTimedOut {
                command: "DEVICE recallPreset 1001".into()
            }
        );
        dsp.close();
    }

    #[tokio::test]
    async fn close_deinitializes() {
        let mut mock = MockTransport::lenient();
        mock.push_unsolicited(BANNER);
        let dsp = fast().build_with_transport(Box::new(mock)).await.unwrap();
        let mut initialized = dsp.initialized_watch();

        initialized.wait_for(|on| *on).await.unwrap();
        dsp.close();
        initialized.wait_for(|on| !*on).await.unwrap();
        assert!(!dsp.is_initialized());
    }
}
