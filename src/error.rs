use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, WatcherError>;
