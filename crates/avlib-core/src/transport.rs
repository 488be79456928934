//! Transport trait for device communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a device:
//! an RS-232 port on a DSP, a telnet/SSH session to its control port, or a
//! mock transport in tests. avlib does not ship concrete serial or socket
//! transports; applications bring their own.
//!
//! Protocol engines (e.g. the command queue in `avlib-text-io`) operate on a
//! `Transport` rather than directly on a port, enabling deterministic unit
//! testing with `MockTransport` from the `avlib-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a device.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Framing and protocol concerns are handled by the engines that
/// consume this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the device.
    ///
    /// Implementations should wait until all bytes have been handed to the
    /// underlying port or socket.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the device into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
