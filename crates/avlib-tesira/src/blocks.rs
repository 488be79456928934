//! Typed wrappers for common Tesira blocks.

use tokio::sync::broadcast;

use avlib_core::error::{Error, Result};

use crate::code::Code;
use crate::descriptor::{AttributeDescriptor, NodeSpec, ValueKind};
use crate::device::Dsp;
use crate::node::{AttributeChanged, AttributeNode, NodeState};
use crate::value::Value;

/// Instance tag of the device-wide service object.
pub const DEVICE_TAG: &str = "DEVICE";

pub static LEVEL_CHANNEL: NodeSpec = NodeSpec {
    name: "level channel",
    attributes: &[
        AttributeDescriptor::subscribed("level", ValueKind::Number),
        AttributeDescriptor::subscribed("mute", ValueKind::Bool),
        AttributeDescriptor::polled("label", ValueKind::Text),
        AttributeDescriptor::polled("minLevel", ValueKind::Number),
        AttributeDescriptor::polled("maxLevel", ValueKind::Number),
    ],
    children: None,
    count_attribute: None,
};

pub static LEVEL_BLOCK: NodeSpec = NodeSpec {
    name: "level block",
    attributes: &[
        AttributeDescriptor::polled("numChannels", ValueKind::Integer),
        AttributeDescriptor::polled("ganged", ValueKind::Bool),
    ],
    children: Some(&LEVEL_CHANNEL),
    count_attribute: Some("numChannels"),
};

pub static MUTE_CHANNEL: NodeSpec = NodeSpec {
    name: "mute channel",
    attributes: &[
        AttributeDescriptor::subscribed("mute", ValueKind::Bool),
        AttributeDescriptor::polled("label", ValueKind::Text),
    ],
    children: None,
    count_attribute: None,
};

pub static MUTE_BLOCK: NodeSpec = NodeSpec {
    name: "mute block",
    attributes: &[AttributeDescriptor::polled("numChannels", ValueKind::Integer)],
    children: Some(&MUTE_CHANNEL),
    count_attribute: Some("numChannels"),
};

fn cached_f64(node: &AttributeNode, attribute: &str) -> Option<f64> {
    node.value(attribute).and_then(|v| v.as_f64().ok())
}

fn cached_bool(node: &AttributeNode, attribute: &str) -> Option<bool> {
    node.value(attribute).and_then(|v| v.as_bool().ok())
}

fn cached_text(node: &AttributeNode, attribute: &str) -> Option<String> {
    node.value(attribute)
        .and_then(|v| v.as_str().map(str::to_string).ok())
}

fn channel_count(node: &AttributeNode) -> Option<u32> {
    node.value("numChannels")
        .and_then(|v| v.as_i64().ok())
        .and_then(|n| u32::try_from(n).ok())
}

// ---------------------------------------------------------------------------
// Level block
// ---------------------------------------------------------------------------

/// A level (fader) block with per-channel level, mute and label.
#[derive(Debug, Clone)]
pub struct LevelBlock {
    node: AttributeNode,
}

impl LevelBlock {
    pub fn new(dsp: &Dsp, instance_tag: impl Into<String>) -> Self {
        Self {
            node: AttributeNode::new(dsp, &LEVEL_BLOCK, instance_tag),
        }
    }

    pub fn node(&self) -> &AttributeNode {
        &self.node
    }

    pub fn state(&self) -> NodeState {
        self.node.state()
    }

    /// Channel `index` (1-based).
    pub fn channel(&self, index: u32) -> Result<LevelChannel> {
        self.node.child(index).map(|node| LevelChannel { node })
    }

    /// Channels known so far, in index order.
    pub fn channels(&self) -> Vec<LevelChannel> {
        self.node
            .children()
            .into_iter()
            .map(|node| LevelChannel { node })
            .collect()
    }

    /// Channel count reported by the device.
    pub fn channel_count(&self) -> Option<u32> {
        channel_count(&self.node)
    }

    pub fn ganged(&self) -> Option<bool> {
        cached_bool(&self.node, "ganged")
    }

    pub fn changes(&self) -> broadcast::Receiver<AttributeChanged> {
        self.node.changes()
    }

    pub fn dispose(&self) {
        self.node.dispose();
    }
}

/// One channel of a [`LevelBlock`].
#[derive(Debug, Clone)]
pub struct LevelChannel {
    node: AttributeNode,
}

impl LevelChannel {
    pub fn node(&self) -> &AttributeNode {
        &self.node
    }

    pub fn index(&self) -> u32 {
        self.node.indices().last().copied().unwrap_or_default()
    }

    /// Level in dB.
    pub fn level(&self) -> Option<f64> {
        cached_f64(&self.node, "level")
    }

    pub fn min_level(&self) -> Option<f64> {
        cached_f64(&self.node, "minLevel")
    }

    pub fn max_level(&self) -> Option<f64> {
        cached_f64(&self.node, "maxLevel")
    }

    pub fn mute(&self) -> Option<bool> {
        cached_bool(&self.node, "mute")
    }

    pub fn label(&self) -> Option<String> {
        cached_text(&self.node, "label")
    }

    pub fn set_level(&self, db: f64) -> Result<()> {
        self.node.set("level", Value::try_from_f64(db)?)
    }

    pub fn increment_level(&self, step_db: f64) -> Result<()> {
        self.node.increment("level", Value::try_from_f64(step_db)?)
    }

    pub fn decrement_level(&self, step_db: f64) -> Result<()> {
        self.node.decrement("level", Value::try_from_f64(step_db)?)
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.node.set("mute", mute)
    }

    pub fn toggle_mute(&self) -> Result<()> {
        self.node.toggle("mute")
    }

    pub fn set_label(&self, label: &str) -> Result<()> {
        self.node.set("label", label)
    }
}

// ---------------------------------------------------------------------------
// Mute block
// ---------------------------------------------------------------------------

/// A mute block with per-channel mute and label.
#[derive(Debug, Clone)]
pub struct MuteBlock {
    node: AttributeNode,
}

impl MuteBlock {
    pub fn new(dsp: &Dsp, instance_tag: impl Into<String>) -> Self {
        Self {
            node: AttributeNode::new(dsp, &MUTE_BLOCK, instance_tag),
        }
    }

    pub fn node(&self) -> &AttributeNode {
        &self.node
    }

    pub fn channel(&self, index: u32) -> Result<MuteChannel> {
        self.node.child(index).map(|node| MuteChannel { node })
    }

    pub fn channel_count(&self) -> Option<u32> {
        channel_count(&self.node)
    }

    pub fn changes(&self) -> broadcast::Receiver<AttributeChanged> {
        self.node.changes()
    }

    pub fn dispose(&self) {
        self.node.dispose();
    }
}

/// One channel of a [`MuteBlock`].
#[derive(Debug, Clone)]
pub struct MuteChannel {
    node: AttributeNode,
}

impl MuteChannel {
    pub fn mute(&self) -> Option<bool> {
        cached_bool(&self.node, "mute")
    }

    pub fn label(&self) -> Option<String> {
        cached_text(&self.node, "label")
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.node.set("mute", mute)
    }

    pub fn toggle_mute(&self) -> Result<()> {
        self.node.toggle("mute")
    }
}

// ---------------------------------------------------------------------------
// Device services
// ---------------------------------------------------------------------------

/// Device-wide services addressed to the `DEVICE` instance.
#[derive(Debug, Clone)]
pub struct DeviceService {
    dsp: Dsp,
}

impl DeviceService {
    pub fn new(dsp: &Dsp) -> Self {
        Self { dsp: dsp.clone() }
    }

    /// Recall a preset by number.
    pub fn recall_preset(&self, id: u32) -> Result<()> {
        self.dsp
            .send(&Code::service(DEVICE_TAG, "recallPreset").value(id))
    }

    /// Recall a preset by its name.
    pub fn recall_preset_by_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidParameter("preset name is empty".into()));
        }
        self.dsp
            .send(&Code::service(DEVICE_TAG, "recallPresetByName").value(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::device;
    use crate::value::Value;
    use avlib_text_io::QueueEvent;

    fn reply(dsp: &Dsp, sink: &crate::device::tests::RecordingSink, text: &str, line: &str) {
        let command = sink
            .commands()
            .into_iter()
            .find(|c| c.trimmed() == text)
            .unwrap_or_else(|| panic!("{text} was not sent"));
        dsp.handle_queue_event(QueueEvent::Response {
            command,
            line: line.to_string(),
        });
    }

    #[test]
    fn level_block_discovers_channels() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let block = LevelBlock::new(&dsp, "Level1");
        assert_eq!(
            sink.lines(),
            vec!["Level1 get numChannels", "Level1 get ganged"]
        );

        reply(&dsp, &sink, "Level1 get numChannels", "+OK \"value\":2");
        reply(&dsp, &sink, "Level1 get ganged", "+OK \"value\":false");
        assert_eq!(block.channel_count(), Some(2));
        assert_eq!(block.ganged(), Some(false));
        assert_eq!(block.channels().len(), 2);

        reply(&dsp, &sink, "Level1 get label 2", "+OK \"value\":\"Lectern Mic\"");
        reply(&dsp, &sink, "Level1 get maxLevel 2", "+OK \"value\":12.000000");
        let channel = block.channel(2).unwrap();
        assert_eq!(channel.index(), 2);
        assert_eq!(channel.label().as_deref(), Some("Lectern Mic"));
        assert_eq!(channel.max_level(), Some(12.0));
        assert_eq!(channel.level(), None);
    }

    #[test]
    fn level_channel_setters() {
        let (dsp, sink) = device();
        let channel = LevelBlock::new(&dsp, "Input1").channel(1).unwrap();
        channel.set_level(-6.0).unwrap();
        channel.increment_level(1.0).unwrap();
        channel.decrement_level(0.5).unwrap();
        channel.set_mute(true).unwrap();
        channel.toggle_mute().unwrap();
        channel.set_label("Podium Mic").unwrap();
        assert_eq!(
            sink.lines(),
            vec![
                "Input1 set level 1 -6",
                "Input1 increment level 1 1",
                "Input1 decrement level 1 0.5",
                "Input1 set mute 1 true",
                "Input1 toggle mute 1",
                "Input1 set label 1 \"Podium Mic\"",
            ]
        );
        assert!(matches!(
            channel.set_level(f64::NAN),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            channel.increment_level(f64::INFINITY),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            channel.set_level(f64::NEG_INFINITY),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn level_channel_zero_is_rejected() {
        let (dsp, _sink) = device();
        let block = LevelBlock::new(&dsp, "Level1");
        assert!(matches!(block.channel(0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn level_feedback_reaches_channel() {
        let (dsp, _sink) = device();
        dsp.set_initialized(true);
        let block = LevelBlock::new(&dsp, "Level1");
        let channel = block.channel(1).unwrap();
        let mut changes = block.changes();

        dsp.handle_queue_event(QueueEvent::Unsolicited(
            "! \"publishToken\":\"Level1-mute-1\" \"value\":true".into(),
        ));
        assert_eq!(channel.mute(), Some(true));
        let change = changes.try_recv().unwrap();
        assert_eq!(change.attribute, "mute");
        assert_eq!(change.value, Value::from(true));
    }

    #[test]
    fn mute_block_channels() {
        let (dsp, sink) = device();
        dsp.set_initialized(true);
        let block = MuteBlock::new(&dsp, "Mute1");
        reply(&dsp, &sink, "Mute1 get numChannels", "+OK \"value\":1");
        assert_eq!(block.channel_count(), Some(1));
        assert!(sink
            .lines()
            .contains(&"Mute1 subscribe mute 1 Mute1-mute-1".to_string()));

        let channel = block.channel(1).unwrap();
        channel.set_mute(false).unwrap();
        channel.toggle_mute().unwrap();
        let lines = sink.lines();
        assert_eq!(&lines[lines.len() - 2..], ["Mute1 set mute 1 false", "Mute1 toggle mute 1"]);

        block.dispose();
        assert!(dsp.registry().is_empty());
    }

    #[test]
    fn device_presets() {
        let (dsp, sink) = device();
        let device = DeviceService::new(&dsp);
        device.recall_preset(1001).unwrap();
        device.recall_preset_by_name("Day Mode").unwrap();
        assert_eq!(
            sink.lines(),
            vec![
                "DEVICE recallPreset 1001",
                "DEVICE recallPresetByName \"Day Mode\"",
            ]
        );
        assert!(device.recall_preset_by_name("").is_err());
    }
}
