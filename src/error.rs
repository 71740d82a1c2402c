use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("state encoding failed: {0}")]
    StateEncode(#[from] bincode::Error),

    #[error("config parse failed: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to compile replacement pipeline ({0})")]
    PipelineCompile(&'static str),

    #[error("corrupt texture cache state: {0}")]
    CorruptState(&'static str),
}
