//! Shared command queue for line-oriented text-protocol devices.
//!
//! This crate provides the single-IO-task pattern for protocols whose
//! commands and replies are one line each (Biamp Tesira TTP and similar).
//! One tokio task owns the transport exclusively and handles command
//! transmission with a minimum inter-command delay, reply timeouts, command
//! echo suppression, unsolicited feedback, and graceful shutdown.
//!
//! # Architecture
//!
//! - [`protocol`] -- line framing and command encoding
//! - [`io`] -- IO task types, spawn, and the select loop

pub mod io;
pub mod protocol;

pub use io::{CommandQueue, OutboundCommand, QueueConfig, QueueEvent, spawn_command_queue};
