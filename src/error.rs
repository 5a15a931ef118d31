use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds maximum message size")]
    FrameTooLarge(usize),

    #[error("Unknown message id: {0:#04x}")]
    UnknownMessage(u8),

    #[error("Preprocess failed for {file:?}: compiler exited with {status}")]
    PreprocessFailure {
        file: PathBuf,
        status: i32,
        stderr: String,
    },

    #[error("Couldn't spawn worker {0:?}: {1}")]
    WorkerSpawn(PathBuf, std::io::Error),

    #[error("Compression error: {0}")]
    Compress(String),

    #[error("Not a compile command: {0}")]
    InvalidCompileCommand(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
