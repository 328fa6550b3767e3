//! Error types for expbuddy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuddyError {
    #[error("{name:?} starts with {prefix:?}, which is a reserved prefix")]
    NamingConflict { name: String, prefix: &'static str },

    #[error("Trying to set {name}, but that's not one of {valid:?}")]
    UnknownParameter { name: String, valid: Vec<String> },

    #[error("Malformed argument {0:?}: expected --name=value")]
    MalformedArgument(String),

    #[error("Cannot parse {raw:?} as {kind} for parameter {name}")]
    InvalidValue {
        name: String,
        raw: String,
        kind: &'static str,
    },

    #[error("Refusing to overwrite registered parameters")]
    AlreadyRegistered,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("`{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging engine channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BuddyError>;
