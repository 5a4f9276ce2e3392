use thiserror::Error;

/// Errors surfaced by the send pipeline.
#[derive(Error, Debug, Clone)]
pub enum ChatError {
    #[error("Request to {model} timed out after {after_secs}s. This may be due to a blocked consent popup or connection issues.")]
    Timeout { model: String, after_secs: f64 },

    #[error("Received empty response from {model}. This model might be temporarily unavailable.")]
    EmptyResponse { model: String },

    #[error("Invalid response format from {model}")]
    InvalidResponseShape { model: String },

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("Consent required: {0}")]
    ConsentRequired(String),

    #[error("Response generation stopped by user")]
    UserAborted,

    #[error("A response is already being generated for this chat")]
    Busy,

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("There is no failed prompt to retry")]
    NothingToRetry,

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Flat classification of [`ChatError`] for renderers and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    EmptyResponse,
    InvalidResponseShape,
    ProviderError,
    ConsentRequired,
    UserAborted,
    Busy,
    InvalidInput,
    StorageQuotaExceeded,
    Storage,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::EmptyResponse { .. } => ErrorKind::EmptyResponse,
            Self::InvalidResponseShape { .. } => ErrorKind::InvalidResponseShape,
            Self::Provider(ProviderError::Cancelled) => ErrorKind::UserAborted,
            Self::Provider(_) => ErrorKind::ProviderError,
            Self::ConsentRequired(_) => ErrorKind::ConsentRequired,
            Self::UserAborted => ErrorKind::UserAborted,
            Self::Busy => ErrorKind::Busy,
            Self::EmptyPrompt | Self::NothingToRetry | Self::UnknownModel(_) => {
                ErrorKind::InvalidInput
            }
            Self::Storage(StorageError::QuotaExceeded { .. }) => ErrorKind::StorageQuotaExceeded,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Provider failures whose message mentions consent or permission are
    /// promoted to [`ChatError::ConsentRequired`].
    pub fn classify(self) -> Self {
        match self {
            Self::Provider(ref e) if e.mentions_consent() => Self::ConsentRequired(e.to_string()),
            other => other,
        }
    }

    /// Whether the bounded retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::UserAborted | ErrorKind::ConsentRequired | ErrorKind::Busy | ErrorKind::InvalidInput
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Missing API key: {0}")]
    MissingApiKey(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn mentions_consent(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("consent") || text.contains("permission")
    }
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage quota exceeded writing '{key}' ({needed} bytes needed, quota {quota})")]
    QuotaExceeded { key: String, needed: u64, quota: u64 },
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error: {0}")]
    File(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}
