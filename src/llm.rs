//! # Model contract
//!
//! The engine never talks to an inference backend directly. It only knows the
//! [GenerateText] trait: prompt text in, [Generation] out. Deployments plug in
//! whatever backend they run; tests plug in fakes. The engine surfaces backend
//! failures unchanged and applies no retry policy of its own.

use std::time::Duration;

use async_trait::async_trait;

/// The result of one model invocation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// The generated text.
    pub content: String,
    /// Tokens consumed by the invocation, as reported by the backend.
    pub tokens: u32,
    /// Wall-clock latency of the invocation.
    pub latency: Duration,
    /// Identifier of the model that produced the text.
    pub model: String,
}

/// Anything that can turn a prompt into generated text.
#[async_trait]
pub trait GenerateText: Send + Sync {
    /// Generate a completion for `prompt`. `model_hint` lets the caller steer
    /// backend model selection; implementations may ignore it.
    async fn generate(
        &self,
        prompt: &str,
        model_hint: Option<&str>,
    ) -> Result<Generation, errors::GenerateError>;
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    /// Failure conditions of the external model, surfaced verbatim. The
    /// engine does not retry; retry policy belongs to the caller.
    #[derive(Debug, Clone)]
    pub enum GenerateError {
        /// The backend is unreachable or returned a server-side failure.
        ModelUnavailable(String),
        /// The backend refused the call due to rate limiting.
        RateLimited(String),
    }

    impl fmt::Display for GenerateError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                GenerateError::ModelUnavailable(cause) => {
                    write!(f, "ModelUnavailable: {}", cause)
                }
                GenerateError::RateLimited(cause) => write!(f, "RateLimited: {}", cause),
            }
        }
    }

    impl Error for GenerateError {}
}
