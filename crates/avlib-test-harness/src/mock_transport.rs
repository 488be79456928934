//! Mock transport for deterministic testing of protocol engines.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test command serialization, reply
//! correlation and feedback dispatch without a DSP on the bench.
//!
//! # Example
//!
//! ```
//! use avlib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine sends this command, reply with this line.
//! mock.expect(b"Level1 get level 1\n", b"+OK \"value\":-6.000000\r\n");
//! // Bytes the device sends on its own, e.g. the login banner.
//! mock.push_unsolicited(b"Welcome to the Tesira Text Protocol Server...\r\n");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avlib_core::error::{Error, Result};
use avlib_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return when the matching request is received.
    response: Vec<u8>,
}

/// Shared, clonable view of everything sent through a [`MockTransport`].
///
/// Obtain one with [`MockTransport::sent_log`] before boxing the transport
/// and handing it to an IO task; the log stays readable from the test.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl SentLog {
    fn push(&self, data: &[u8]) {
        if let Ok(mut log) = self.0.lock() {
            log.push(data.to_vec());
        }
    }

    /// Every `send()` payload so far, in order.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Every `send()` payload decoded as UTF-8 (lossy), in order.
    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|e| String::from_utf8_lossy(e).into_owned())
            .collect()
    }

    /// Number of `send()` calls recorded.
    pub fn len(&self) -> usize {
        self.0.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Whether nothing has been sent yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mock [`Transport`] for testing protocol engines without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation. The
/// corresponding response is then returned by subsequent `receive()` calls.
///
/// In strict mode (the default) a send that does not match the next
/// expectation returns [`Error::Protocol`]. In lenient mode
/// ([`MockTransport::lenient`]) unmatched sends succeed and produce no reply,
/// which suits tests that only care about a subset of the traffic.
#[derive(Debug)]
pub struct MockTransport {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// The response data pending for the next `receive()` call.
    pending_response: Option<Vec<u8>>,
    /// Cursor into the pending response (how many bytes have been read so far).
    response_cursor: usize,
    /// Data delivered by `receive()` when no response is pending.
    unsolicited: VecDeque<Vec<u8>>,
    /// Whether unmatched sends are tolerated.
    lenient: bool,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: SentLog,
}

impl MockTransport {
    /// Create a new strict mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            pending_response: None,
            response_cursor: 0,
            unsolicited: VecDeque::new(),
            lenient: false,
            connected: true,
            sent_log: SentLog::default(),
        }
    }

    /// Create a mock transport that accepts sends with no matching expectation.
    pub fn lenient() -> Self {
        MockTransport {
            lenient: true,
            ..Self::new()
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, the subsequent
    /// `receive()` calls will return `response`.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Queue bytes the device sends without being asked.
    ///
    /// Unsolicited chunks are delivered in order by `receive()` whenever no
    /// command response is pending.
    pub fn push_unsolicited(&mut self, data: &[u8]) {
        self.unsolicited.push_back(data.to_vec());
    }

    /// Return a shared handle onto the log of sent data.
    pub fn sent_log(&self) -> SentLog {
        self.sent_log.clone()
    }

    /// Return all data that has been sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent_log.entries()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        self.sent_log.push(data);

        let matches_next = self
            .expectations
            .front()
            .is_some_and(|e| e.request.as_slice() == data);

        if matches_next {
            if let Some(expectation) = self.expectations.pop_front() {
                self.pending_response = Some(expectation.response);
                self.response_cursor = 0;
            }
            return Ok(());
        }

        if self.lenient {
            return Ok(());
        }

        match self.expectations.front() {
            Some(expectation) => Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            ))),
            None => Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            )),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if self.pending_response.is_none() {
            if let Some(chunk) = self.unsolicited.pop_front() {
                self.pending_response = Some(chunk);
                self.response_cursor = 0;
            }
        }

        if let Some(ref response) = self.pending_response {
            let remaining = &response[self.response_cursor..];
            if remaining.is_empty() {
                self.pending_response = None;
                self.response_cursor = 0;
                return Err(Error::Timeout);
            }
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.response_cursor += n;
            if self.response_cursor >= response.len() {
                self.pending_response = None;
                self.response_cursor = 0;
            }
            Ok(n)
        } else {
            Err(Error::Timeout)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending_response = None;
        self.response_cursor = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
