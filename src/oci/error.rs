use thiserror::Error;

#[derive(Debug, Error)]
pub enum OciError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("private image requires authentication: {0}")]
    PrivateImage(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("registry error: {0}")]
    Registry(String),
}
