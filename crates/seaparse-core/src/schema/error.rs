use thiserror::Error;

/// Configuration problems detected before any record is parsed.
///
/// # Examples
/// ```
/// use seaparse_core::ConfigError;
///
/// let err = ConfigError::DuplicateField {
///     instrument: "adcp".to_string(),
///     field: "heading".to_string(),
/// };
/// assert!(err.to_string().contains("duplicate field"));
/// ```
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid instrument document: {message}")]
    Toml { message: String },
    #[error("unknown instrument '{id}'")]
    UnknownInstrument { id: String },
    #[error("instrument '{id}' is declared twice")]
    DuplicateInstrument { id: String },
    #[error("instrument '{instrument}': duplicate field '{field}'")]
    DuplicateField { instrument: String, field: String },
    #[error("instrument '{instrument}': {message}")]
    InvalidFraming { instrument: String, message: String },
    #[error("instrument '{instrument}': field '{field}': {message}")]
    InvalidField {
        instrument: String,
        field: String,
        message: String,
    },
    #[error("instrument '{instrument}': field '{field}' references unknown field '{reference}'")]
    UnknownReference {
        instrument: String,
        field: String,
        reference: String,
    },
    #[error("instrument '{instrument}': invalid pattern: {message}")]
    InvalidPattern { instrument: String, message: String },
    #[error("instrument '{instrument}': invalid clock: {message}")]
    InvalidClock { instrument: String, message: String },
    #[error("instrument '{instrument}': invalid echogram settings: {message}")]
    InvalidEchogram { instrument: String, message: String },
    #[error("instrument '{instrument}': stream '{stream}': {message}")]
    InvalidStream {
        instrument: String,
        stream: String,
        message: String,
    },
    #[error("instrument '{instrument}' needs exactly one of a binary layout or a grammar")]
    MissingSchema { instrument: String },
}
