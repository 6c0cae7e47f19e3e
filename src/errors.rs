use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("wrong interval: from={from} to={to}")]
    WrongInterval { from: u64, to: u64 },

    #[error("memory allocator exhausted")]
    AllocatorExhausted,

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("corrupt page {0}: {1}")]
    CorruptPage(String, String),

    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("tier halted after write failure: {0}")]
    TierHalted(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("query cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DbError>;
