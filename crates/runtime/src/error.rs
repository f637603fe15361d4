//! Errors that cross the turn engine's public boundary.
//!
//! Everything else (fallback-eligible provider errors, tool failures) is
//! absorbed inside the engine and turned into a retry or a recorded tool
//! result.

use rb_domain::error::Error;
use rb_providers::{ContextLengthInfo, ErrorClass, FallbackEligible};

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Nothing was rendered into the room yet.  The fallback chain may
    /// retry it, otherwise it is reported as a clean failure.
    #[error("turn failed before any output ({}): {source}", .class.label())]
    PreDelta {
        class: ErrorClass,
        #[source]
        source: Error,
    },

    /// Partial output is already visible, so a silent retry would
    /// duplicate it.
    #[error("turn failed after output was rendered: {message}")]
    NonFallback { message: String },

    /// The prompt does not fit.  The caller prunes history and starts over.
    #[error("context window exceeded (max {:?}, requested {:?})", .0.model_max_tokens, .0.requested_tokens)]
    ContextLength(ContextLengthInfo),
}

impl TurnError {
    /// Short label for statuses and trace events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreDelta { .. } => "pre_delta",
            Self::NonFallback { .. } => "non_fallback",
            Self::ContextLength(_) => "context_length",
        }
    }
}

impl FallbackEligible for TurnError {
    fn fallback_class(&self) -> Option<ErrorClass> {
        match self {
            Self::PreDelta { class, .. } if class.triggers_fallback() => Some(class.clone()),
            _ => None,
        }
    }
}

/// Admission failures reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("queue for room {room_id} is full; message rejected")]
    Rejected { room_id: String },
}
