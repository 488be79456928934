//! avlib-core: Core traits, types, and error definitions for avlib.
//!
//! This crate defines the vendor-agnostic pieces shared by every avlib
//! driver: the byte-level [`Transport`] a driver talks through, the
//! [`DeviceEvent`]s a driver broadcasts, and the common [`Error`] type.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`DeviceEvent`] -- asynchronous device-level notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;

pub use error::{Error, Result};
pub use events::DeviceEvent;
pub use transport::Transport;
