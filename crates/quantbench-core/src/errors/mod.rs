//! Typed error kinds for remote calls against the inference server, the
//! judge back-ends, and third-party registries. The retry kernel keys its
//! decisions off these kinds; orchestration code above them propagates
//! `anyhow` with context.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {code}: {body}")]
    ServerStatus { code: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server did not return log-probabilities; upgrade the inference server")]
    LogprobsUnavailable,

    #[error("rate limited")]
    RateLimited {
        /// Reset hint from the remote side, when one was advertised.
        reset: Option<Duration>,
    },
}

impl ClientError {
    /// Whether the retry kernel may try this call again.
    ///
    /// Not-found, missing logprobs and confirmed cancellation are final;
    /// 4xx statuses other than 429 indicate a request the server will keep
    /// rejecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) | ClientError::RateLimited { .. } => {
                true
            }
            ClientError::ServerStatus { code, .. } => *code >= 500,
            ClientError::Cancelled
            | ClientError::NotFound(_)
            | ClientError::LogprobsUnavailable => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// Map a transport-level reqwest failure onto a kind. Status-bearing
    /// responses are classified by the caller, which still has the body.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(Duration::ZERO)
        } else {
            ClientError::Network(err.to_string())
        }
    }

    /// Classify an HTTP status line plus body into a kind.
    pub fn from_status(code: u16, body: String, reset: Option<Duration>) -> Self {
        match code {
            404 => ClientError::NotFound(body),
            429 => ClientError::RateLimited { reset },
            _ => ClientError::ServerStatus { code, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Network("refused".into()).is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ClientError::RateLimited { reset: None }.is_retryable());
        assert!(ClientError::ServerStatus {
            code: 503,
            body: String::new()
        }
        .is_retryable());

        assert!(!ClientError::ServerStatus {
            code: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!ClientError::NotFound("x".into()).is_retryable());
        assert!(!ClientError::LogprobsUnavailable.is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            ClientError::from_status(404, "no model".into(), None),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            ClientError::from_status(429, String::new(), Some(Duration::from_secs(30))),
            ClientError::RateLimited { reset: Some(_) }
        ));
        assert!(matches!(
            ClientError::from_status(500, String::new(), None),
            ClientError::ServerStatus { code: 500, .. }
        ));
    }
}
