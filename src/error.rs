use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of device memory: requested {requested} bytes, {available} free")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Unknown buffer handle: {0}")]
    BadHandle(u32),

    #[error("Invalid binary container: {0}")]
    InvalidContainer(String),

    #[error("Channel to the device process is not established")]
    ChannelClosed,

    #[error("Short transfer: {completed} of {requested} bytes")]
    ShortTransfer { completed: u64, requested: u64 },

    #[error("Device process exited unexpectedly")]
    PeerDied,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// A convenient alias
pub type ShimResult<T> = Result<T, ShimError>;
