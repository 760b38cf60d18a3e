use thiserror::Error;

/// Failures at the store and broadcaster seams.
///
/// Every variant is scoped: a transport failure closes one subscription, a
/// store read failure costs one fixture its rows, a malformed snapshot costs
/// one snapshot (or one prop). None of them is fatal to the board.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("store read failed: {0}")]
    StoreRead(String),

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

impl FeedError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        FeedError::Transport(e.to_string())
    }

    pub fn store(e: impl std::fmt::Display) -> Self {
        FeedError::StoreRead(e.to_string())
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Failures seen by callers of the board runtime.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BoardError {
    #[error("board runtime has stopped")]
    Stopped,

    #[error(transparent)]
    Feed(#[from] FeedError),
}
