use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreErr>;

#[derive(Error, Debug)]
pub enum CoreErr {
    /// Crypto material is required but the master key was never derived.
    #[error("master key not set; call set_password first")]
    KeyNotSet,

    /// An existing record is encrypted and rewriting it without the key
    /// would silently downgrade it to plaintext.
    #[error("record is encrypted and the master key is not set; write refused")]
    EncryptedWithoutKey,

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptFailed,

    #[error("invalid encrypted payload: {0}")]
    BadEnvelope(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
