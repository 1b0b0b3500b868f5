use thiserror::Error;

pub type Result<T> = std::result::Result<T, RendererError>;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Render service at {addr} did not become available within {waited_secs}s")]
    Unavailable { addr: String, waited_secs: u64 },
}

impl From<reqwest::Error> for RendererError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RendererError::Network(format!("timeout: {err}"))
        } else {
            RendererError::Network(err.to_string())
        }
    }
}
