//! Device-level event types.
//!
//! Events are emitted by drivers through a `tokio::sync::broadcast`-style
//! channel when something happens at the device level rather than on a
//! particular attribute. Attribute value changes are reported separately by
//! the attribute tree of each driver.

/// An event emitted by a driver about the device as a whole.
///
/// Events are delivered on a best-effort basis; slow consumers of a bounded
/// broadcast channel may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device finished its session setup and accepts attribute traffic.
    Initialized,

    /// The device is no longer initialized (connection closed or reset).
    Deinitialized,

    /// A command received no reply within the configured reply timeout.
    CommandTimedOut {
        /// The serialized command, without its line terminator.
        command: String,
    },

    /// The device rejected a command with an error reply.
    DeviceError {
        /// The serialized command, without its line terminator.
        command: String,
        /// The error text reported by the device.
        message: String,
    },
}
