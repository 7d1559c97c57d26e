//! ringmaster: a process supervisor driven over a TCP control plane.
//!
//! - [`controller`] routes `verb [show] [args...]` commands to the
//!   [`trainer`] and its [`show`]s and replies to each caller.
//! - [`flapping`] watches show lifecycle events from [`pubsub`] and stops,
//!   restarts, or terminates shows whose processes die too quickly.
//! - [`daemon`] wires both together from a [`config::ProjectConfig`].

pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod flapping;
pub mod log;
pub mod protocol;
pub mod pubsub;
pub mod show;
pub mod target;
pub mod trainer;
