use thiserror::Error;

/// Failures a command caller has to know about. Everything else in the core is recovered
/// locally and only logged.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Record {0} does not exist")]
    RecordNotFound(i64),
    #[error("Settings patch must be a JSON object")]
    SettingsPatchNotObject,
    #[error("Settings patch doesn't fit the settings shape: {0}")]
    InvalidSettings(#[source] serde_json::Error),
    #[error("Screenshot is not an inline base64 image")]
    NotInlineImage,
    #[error("Screenshot payload is not valid base64: {0}")]
    InvalidImage(#[from] base64::DecodeError),
    #[error("Failed to store screenshot: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
