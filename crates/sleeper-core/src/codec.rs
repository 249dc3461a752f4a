//! Work item payload encoding.
//!
//! A payload is carried as the text body of a queue message. [`SleepPayload`]
//! is the sample workload (a whole number of seconds); [`WorkItem`] carries
//! arbitrary UTF-8 text for other units of work.

use queue_runtime::provider::ProviderType;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// Largest payload accepted for encoding, in bytes
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Errors raised while encoding or decoding a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed payload '{text}': {reason}")]
    MalformedPayload { text: String, reason: String },

    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },
}

/// Conversion between a payload value and the queue message text
pub trait Payload: Sized {
    /// Render the payload as message text
    fn encode(&self) -> Result<String, CodecError>;

    /// Parse message text back into a payload
    fn decode(text: &str) -> Result<Self, CodecError>;
}

// ============================================================================
// SleepPayload
// ============================================================================

/// A non-negative number of seconds to sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SleepPayload {
    seconds: u64,
}

impl SleepPayload {
    pub fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl Payload for SleepPayload {
    fn encode(&self) -> Result<String, CodecError> {
        Ok(self.seconds.to_string())
    }

    fn decode(text: &str) -> Result<Self, CodecError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(CodecError::MalformedPayload {
                text: text.to_string(),
                reason: "payload is empty".to_string(),
            });
        }

        trimmed
            .parse::<u64>()
            .map(Self::from_secs)
            .map_err(|e| CodecError::MalformedPayload {
                text: text.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for SleepPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seconds)
    }
}

impl FromStr for SleepPayload {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

// ============================================================================
// WorkItem
// ============================================================================

/// Opaque text payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Payload for WorkItem {
    fn encode(&self) -> Result<String, CodecError> {
        let max_size = MAX_PAYLOAD_BYTES.min(ProviderType::AzureStorage.max_message_size());
        if self.0.len() > max_size {
            return Err(CodecError::PayloadTooLarge {
                size: self.0.len(),
                max_size,
            });
        }
        Ok(self.0.clone())
    }

    fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(Self(text.to_string()))
    }
}

impl From<SleepPayload> for WorkItem {
    fn from(payload: SleepPayload) -> Self {
        Self(payload.seconds.to_string())
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
