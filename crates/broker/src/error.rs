use std::error::Error as StdError;

/// Crate-wide result type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed broker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Broker unreachable or the connection/channel pair is invalid.
    #[error("broker connection error: {message}")]
    Connection { message: String },

    /// Operation requested for an agent the registry does not know.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Envelope could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The consumer callback failed while processing a delivery.
    #[error("message processing failed: {source}")]
    Processing {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Consumer gave up after exhausting its reconnect attempts.
    #[error("consumer for agent {agent} stopped after {attempts} reconnect attempts")]
    RetryExhausted { agent: String, attempts: u32 },

    /// Wrapped failure from the broker client.
    #[error("broker operation failed: {context}: {source}")]
    Broker {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn connection(message: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn validation(message: impl std::fmt::Display) -> Self {
        Self::Validation {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn processing(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Processing {
            source: source.into(),
        }
    }

    #[must_use]
    pub fn broker(context: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Broker {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
