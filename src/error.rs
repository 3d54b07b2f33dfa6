use std::io;

/// Errors raised by the supervisor core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream reached end-of-input before a complete packet was read.
    #[error("stream closed before a complete packet was received")]
    StreamClosed,

    /// The payload does not fit the 32-bit length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The build tool could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
