//! Local build supervisor.
//!
//! Accepts framed COMPILE/CANCEL commands over a point-to-point byte stream,
//! runs the requested build as a child process and streams its combined
//! output back, followed by the exit status. Unix only.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
