/// Errors from the generation API client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("API error ({status}, {code}): {message}")]
    Api {
        status: u16,
        /// Machine-readable code from the error body, e.g. `NOT_OWNER`.
        code: String,
        message: String,
    },
}

impl ClientError {
    /// The API error code, if the server produced one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            ClientError::Request(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }
}
