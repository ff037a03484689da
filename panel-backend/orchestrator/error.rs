use serde::Serialize;

/// Uniform failure value for every orchestrator call.
///
/// Transport failures, non-2xx responses and malformed bodies all collapse
/// into this type; callers only branch on [`OrchestratorError::is_not_found`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("orchestrator returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Wire shape of an orchestrator error: `{message, status?}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl OrchestratorError {
    pub fn status(&self) -> Option<u16> {
        match self {
            OrchestratorError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Short user-facing message.
    pub fn message(&self) -> String {
        match self {
            OrchestratorError::Http { status: 404, .. } => "not found".to_string(),
            OrchestratorError::Http { message, .. } => message.clone(),
            OrchestratorError::Transport(message) | OrchestratorError::Malformed(message) => {
                message.clone()
            }
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.message(),
            status: self.status(),
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OrchestratorError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            OrchestratorError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            OrchestratorError::Transport(err.to_string())
        }
    }
}
