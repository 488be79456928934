//! Error types for avlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! value-decoding errors are all captured here.

/// The error type for all avlib operations.
///
/// Variants cover the failure modes encountered when talking to a device:
/// physical transport failures, malformed protocol payloads, values of the
/// wrong shape, timeouts, and use of torn-down objects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, telnet session).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected reply, error status from the device).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response from the device.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the device has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the device was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// A protocol value could not be parsed.
    ///
    /// `position` is the byte offset into the parsed text where the problem
    /// was detected.
    #[error("malformed value at byte {position}: {reason}")]
    MalformedValue {
        /// Byte offset of the offending input.
        position: usize,
        /// What the parser expected or found.
        reason: String,
    },

    /// A value was extracted as the wrong variant.
    ///
    /// This usually means the device firmware speaks a different protocol
    /// revision than the driver expects.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The variant the caller asked for.
        expected: &'static str,
        /// The variant actually present.
        found: &'static str,
    },

    /// The object has been disposed and no longer accepts requests.
    #[error("object disposed")]
    Disposed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("-ERR address not found".into());
        assert_eq!(e.to_string(), "protocol error: -ERR address not found");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_malformed_value() {
        let e = Error::MalformedValue {
            position: 7,
            reason: "unterminated string".into(),
        };
        assert_eq!(
            e.to_string(),
            "malformed value at byte 7: unterminated string"
        );
    }

    #[test]
    fn error_display_type_mismatch() {
        let e = Error::TypeMismatch {
            expected: "number",
            found: "record",
        };
        assert_eq!(e.to_string(), "type mismatch: expected number, found record");
    }

    #[test]
    fn error_display_disposed() {
        assert_eq!(Error::Disposed.to_string(), "object disposed");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
