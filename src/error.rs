// src/error.rs
//! Error taxonomy shared by the analysis pipeline and its service adapters.

use thiserror::Error;

/// Errors produced while preparing media, talking to remote services or
/// running the two analysis stages.
#[derive(Debug, Error)]
pub enum CoachError {
    /// Rejected locally before any remote call was made.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A poll ceiling or request deadline was exceeded.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote service answered with an error payload.
    #[error("Remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The request never produced a usable HTTP response.
    #[error("Network error: {0}")]
    Transport(String),

    /// The remote side reported a terminal processing failure for an upload.
    #[error("Remote processing failed for {name}: {reason}")]
    ProcessingFailed { name: String, reason: String },

    /// The model returned no text or signalled a block.
    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Voice synthesis unavailable: {0}")]
    VoiceUnavailable(String),

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoachError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoachError::Timeout(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CoachError::Validation(_))
    }

    /// Message suitable for showing to the person who asked for the analysis.
    pub fn user_message(&self) -> String {
        match self {
            CoachError::Timeout(_) => {
                "Analysis timed out: the video may be too long to process. Try with a shorter clip."
                    .to_string()
            }
            err if crate::retry::is_rate_limit_error(err) => {
                "API rate limit exceeded. Please try again in a few minutes.".to_string()
            }
            CoachError::ProcessingFailed { reason, .. } => {
                format!("The media could not be processed: {}", reason)
            }
            CoachError::ContentRejected(reason) => {
                format!("The model declined to analyze this media: {}", reason)
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for CoachError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoachError::Timeout(err.to_string())
        } else {
            CoachError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_suggests_shorter_clip() {
        let err = CoachError::Timeout("processing exceeded 180s".into());
        assert!(err.user_message().contains("shorter clip"));
        assert!(err.is_timeout());
    }

    #[test]
    fn quota_errors_get_rate_limit_message() {
        let err = CoachError::Api {
            status: 429,
            message: "Quota exceeded for requests per minute".into(),
        };
        assert_eq!(
            err.user_message(),
            "API rate limit exceeded. Please try again in a few minutes."
        );
    }

    #[test]
    fn generic_api_errors_keep_their_text() {
        let err = CoachError::Api {
            status: 500,
            message: "internal failure".into(),
        };
        assert_eq!(err.user_message(), "Remote API error (500): internal failure");
    }
}
