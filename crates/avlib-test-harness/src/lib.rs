//! avlib-test-harness: Test utilities and mock transports for avlib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! protocol engines without requiring real hardware.

pub mod mock_transport;

pub use mock_transport::{MockTransport, SentLog};
