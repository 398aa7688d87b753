//! Main crate error.

use anyhow::Error as AnyError;

/// Handles conversion of an anyhow error into an [`EngineError`] when the
/// stream-processing loop encounters an error.
pub fn processing_error(err: AnyError) -> EngineError {
    if let Some(_err) = err.downcast_ref::<serde_json::Error>() {
        return EngineError::SerdeJson;
    }

    if let Some(_err) = err.downcast_ref::<std::str::Utf8Error>() {
        return EngineError::Utf8;
    }

    if let Ok(err) = err.downcast::<EngineError>() {
        return err;
    }

    EngineError::Unhandled
}

/// Handles converting from [`tokio_tungstenite::tungstenite::Error`] to [`EngineError`].
pub fn convert_tungstenite_error(error: tokio_tungstenite::tungstenite::Error) -> EngineError {
    EngineError::Stream(error.to_string())
}

/// Main error enum.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Config is missing a value the operation needs.
    #[error("missing `{0}` from Config")]
    ConfigMissing(String),
    /// The OAuth flow could not produce a usable session.
    #[error("authorization failed: {0}")]
    AuthFailed(String),
    /// The refresh token was rejected; a full re-authorize is required.
    #[error("access token refresh rejected by the token endpoint")]
    RefreshRejected,
    /// A request kept returning 401 after refresh and re-authorize.
    #[error("request unauthorized after token refresh and re-authorize")]
    Unauthorized,
    /// The broker accepted the request but returned an order error.
    #[error("order rejected: {0}")]
    OrderRejected(String),
    /// The streaming subscription could not be established.
    #[error("ENS subscription failed: {0}")]
    Subscription(String),
    /// A binary frame carried a payload format other than JSON.
    #[error("unsupported ENS payload format `{0}`")]
    PayloadFormat(u8),
    /// The websocket transport failed.
    #[error("websocket transport error: {0}")]
    Stream(String),
    /// The HTTP transport failed outright.
    #[error("http transport error: {0}")]
    Http(String),
    /// The broker answered with an unexpected status.
    #[error("request failed with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The crash-recovery state file could not be read or written.
    #[error("state file error: {0}")]
    State(String),
    /// Serde JSON from_str failed.
    #[error("serde_json error occurred")]
    SerdeJson,
    /// UTF-8 conversion error.
    #[error("failed conversion from data to utf8")]
    Utf8,
    /// An explicit decision to stop the orchestrator.
    #[error("trading halted: {0}")]
    Halt(String),
    /// An error we don't handle at the time.
    #[error("we aren't handling this right now")]
    Unhandled,
}

impl From<serde_json::Error> for EngineError {
    fn from(_value: serde_json::Error) -> Self {
        EngineError::SerdeJson
    }
}
