//! Client for the Biamp Tesira Text Protocol (TTP).
//!
//! TTP is a line-oriented protocol spoken over telnet or SSH. Every DSP
//! block is addressed by its instance tag, and every command names a verb
//! and an attribute, optionally followed by channel indices and a value:
//!
//! ```text
//! Level1 get level 1
//! +OK "value":-6.000000
//! Level1 subscribe level 1 Level1-level-1
//! ! "publishToken":"Level1-level-1" "value":-10.000000
//! ```
//!
//! # Layers
//!
//! - [`value`]: the scalar/list/record value grammar.
//! - [`code`]: command codes and their wire form.
//! - [`key`] and [`registry`]: correlation keys and the callback registry
//!   that routes replies and publish lines back to whoever asked.
//! - [`node`]: the attribute tree runtime. Blocks initialize when the device
//!   does, keep a cache of their attributes, and create channels lazily.
//! - [`blocks`]: typed wrappers for level and mute blocks and device services.
//! - [`device`] and [`builder`]: the shared device handle and its receive
//!   path, wired to an `avlib-text-io` command queue.

pub mod blocks;
pub mod builder;
pub mod code;
pub mod descriptor;
pub mod device;
pub mod key;
pub mod node;
pub mod registry;
pub mod response;
pub mod value;

pub use blocks::{DeviceService, LevelBlock, LevelChannel, MuteBlock, MuteChannel};
pub use builder::DspBuilder;
pub use code::{Code, Operation, Verb};
pub use descriptor::{AttributeDescriptor, NodeSpec, ValueKind};
pub use device::{CommandSink, Dsp, DspOptions};
pub use key::correlation_key;
pub use node::{AttributeChanged, AttributeNode, NodeState};
pub use registry::{Dispatch, FeedbackCallback, Registry};
pub use response::Response;
pub use value::{Scalar, Value};
