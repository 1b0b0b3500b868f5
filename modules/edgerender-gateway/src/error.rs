//! Pipeline failures and their HTTP mapping. Status-rule responses are
//! successful outcomes, not errors; everything here ends a request with an
//! error status.

use thiserror::Error;

use renderer_client::RenderErrorType;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unauthorized: invalid render key")]
    Unauthorized,

    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("invalid_url: {0}")]
    InvalidUrl(String),

    #[error("blocked by url rule")]
    Blocked,

    #[error("blocked: no dimension matched the user agent")]
    DimensionBlocked,

    #[error("render failed: {message}")]
    RenderFailed {
        error_type: Option<RenderErrorType>,
        message: String,
    },

    #[error("pool_unavailable: no healthy render service instance")]
    RsUnavailable,

    #[error("origin fetch failed: {0}")]
    OriginFetch(String),

    #[error("hard_timeout: request deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    /// A coalesced waiter inheriting the leader's failure, status included.
    #[error("{message}")]
    Coalesced { status: u16, message: String },
}

impl PipelineError {
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Unauthorized => 401,
            PipelineError::UnknownHost(_) => 404,
            PipelineError::InvalidUrl(_) => 400,
            PipelineError::Blocked | PipelineError::DimensionBlocked => 403,
            PipelineError::RenderFailed { error_type, .. } => error_type
                .map(|t| t.http_status())
                // Transport-level RS failure with no taxonomy: bad gateway.
                .unwrap_or(502),
            PipelineError::RsUnavailable => 503,
            PipelineError::OriginFetch(_) => 502,
            PipelineError::DeadlineExceeded => 504,
            PipelineError::Internal(_) => 500,
            PipelineError::Coalesced { status, .. } => *status,
        }
    }
}

/// Clonable form shared with single-flight waiters.
#[derive(Debug, Clone)]
pub struct SharedError {
    pub status: u16,
    pub message: String,
}

impl From<&PipelineError> for SharedError {
    fn from(err: &PipelineError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_drives_render_failure_status() {
        let hard = PipelineError::RenderFailed {
            error_type: Some(RenderErrorType::HardTimeout),
            message: "deadline".into(),
        };
        assert_eq!(hard.status(), 504);

        let crash = PipelineError::RenderFailed {
            error_type: Some(RenderErrorType::ChromeCrash),
            message: "crash".into(),
        };
        assert_eq!(crash.status(), 503);

        let unknown = PipelineError::RenderFailed {
            error_type: None,
            message: "connection refused".into(),
        };
        assert_eq!(unknown.status(), 502);
    }

    #[test]
    fn auth_and_rule_statuses() {
        assert_eq!(PipelineError::Unauthorized.status(), 401);
        assert_eq!(PipelineError::Blocked.status(), 403);
        assert_eq!(PipelineError::DeadlineExceeded.status(), 504);
        assert_eq!(PipelineError::UnknownHost("x".into()).status(), 404);
    }
}
