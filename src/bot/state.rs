use crate::download::SessionId;
use serde::{Deserialize, Serialize};

/// Represents the current state of the user dialogue
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum State {
    /// Waiting for a link
    #[default]
    Start,
    /// Archive prepared, waiting for the extract answer
    AwaitingExtractChoice {
        /// Prepared session
        session_id: SessionId,
    },
    /// Waiting for the delivery mode answer
    AwaitingDeliveryMode {
        /// Prepared session
        session_id: SessionId,
        /// Extract answer, `false` for non-archives
        extract: bool,
    },
}

impl State {
    /// Session prepared but not started yet, if any
    #[must_use]
    pub const fn pending_session(&self) -> Option<SessionId> {
        match self {
            Self::Start => None,
            Self::AwaitingExtractChoice { session_id }
            | Self::AwaitingDeliveryMode { session_id, .. } => Some(*session_id),
        }
    }
}
