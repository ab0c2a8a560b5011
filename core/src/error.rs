//! Error taxonomy for the chat pipeline

use axum::http::StatusCode;
use thiserror::Error;

/// Fixed user-facing text for 500 responses.
pub const GENERIC_ERROR_MESSAGE: &str =
    "Erro técnico de conexão com a IA. Tente novamente em instantes.";

/// Wait suggested to the client when the upstream gave no retry delay.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("request body is not valid JSON for this endpoint: {0}")]
    InvalidBody(String),

    #[error("message or image is required")]
    MissingInput,

    #[error("image is not a valid base64 data URI")]
    MalformedMedia,

    #[error("upstream rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("upstream failed: {0}")]
    Upstream(String),

    #[error("upstream returned no valid content")]
    NoContent,

    #[error("no candidate models configured")]
    NoCandidates,
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) | Self::MissingInput | Self::MalformedMedia => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::NoContent | Self::NoCandidates => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Vendor-neutral message safe to show to end users.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidBody(_) => "Requisição inválida".to_string(),
            Self::MissingInput => "Mensagem ou imagem é obrigatória".to_string(),
            Self::MalformedMedia => "Formato de imagem inválido".to_string(),
            Self::RateLimited { .. } => format!(
                "Opa! A IA atingiu o limite de uso. Espere {}s e tente de novo! ⏳",
                self.retry_after_secs()
            ),
            Self::Upstream(_) | Self::NoContent | Self::NoCandidates => {
                GENERIC_ERROR_MESSAGE.to_string()
            }
        }
    }

    /// Diagnostic detail for server errors and unparseable bodies. Rate limits
    /// never expose upstream text.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::Upstream(message) | Self::InvalidBody(message) => Some(message.clone()),
            Self::NoContent | Self::NoCandidates => Some(self.to_string()),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::RateLimited { retry_after_secs, .. } => {
                retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS)
            }
            _ => 0,
        }
    }
}
