use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GptError>;

/// Everything that can go wrong between building a prompt and handing a
/// parsed answer back to the chat.
#[derive(Error, Debug)]
pub enum GptError {
    #[error("Invalid request: {0}")]
    InvalidArgument(String),

    /// Network or HTTP failure talking to the generation endpoint.
    #[error("Failed to generate content")]
    Transport(String),

    #[error("Rate limit exceeded. Try again in {}.", wait_text(retry_after))]
    RateLimited { retry_after: Duration },

    /// The model answered, but not in the shape we asked for.
    #[error("Malformed response from the model: {0}")]
    MalformedUpstreamPayload(String),

    #[error("Generated question failed validation: {0}")]
    ValidationFailed(String),
}

/// Whole seconds, rounded up, never below one.
fn wait_text(wait: &Duration) -> String {
    let secs = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
    if secs == 1 {
        "1 second".to_string()
    } else {
        format!("{secs} seconds")
    }
}

impl GptError {
    /// Short text that is safe to show to the person in the chat.
    pub fn user_message(&self) -> String {
        match self {
            GptError::InvalidArgument(reason) => format!("Hmm, that doesn't look right: {reason}"),
            GptError::RateLimited { .. } => self.to_string(),
            GptError::Transport(_) => "Failed to generate content, please try again.".to_string(),
            GptError::MalformedUpstreamPayload(_) | GptError::ValidationFailed(_) => {
                "The model got confused this time. Try again or pick another topic.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for GptError {
    fn from(err: reqwest::Error) -> Self {
        GptError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GptError {
    fn from(err: serde_json::Error) -> Self {
        GptError::MalformedUpstreamPayload(err.to_string())
    }
}
