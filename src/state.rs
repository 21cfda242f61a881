//! Session state machine
//!
//! ```text
//! Disconnected → Connecting → Registering → Authenticated → Streaming
//!                    ↓             ↓  ↘ (auth nack)  ↓            ↓
//!                    ↓             ↓   Disconnected   ↓            ↓
//!                    └───────── Closing ←─────────────┴────────────┘
//!                                  ↓
//!                            Disconnected → Failed (retry ceiling, terminal)
//! ```

use crate::error::{ComfoError, Result};
use serde::Serialize;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// PIN registration sent, waiting for the unit's verdict
    Registering,
    Authenticated,
    /// Authenticated and at least one property subscribed on the wire
    Streaming,
    Closing,
    /// Reconnect ceiling exceeded, nothing more will happen
    Failed,
}

impl SessionState {
    /// Attempt a transition to a new state
    pub fn try_transition(self, to: SessionState) -> Result<SessionState> {
        use SessionState::*;

        let valid = match (self, to) {
            (Disconnected, Connecting) => true,
            (Disconnected, Failed) => true,

            // socket failure, or a handshake that went nowhere
            (Connecting, Registering) => true,
            (Connecting, Disconnected) => true,
            (Connecting, Closing) => true,

            (Registering, Authenticated) => true,
            // PIN rejected
            (Registering, Disconnected) => true,
            (Registering, Closing) => true,

            (Authenticated, Streaming) => true,
            (Authenticated, Closing) => true,

            (Streaming, Closing) => true,

            (Closing, Disconnected) => true,

            (Failed, _) => false,
            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(ComfoError::InvalidTransition { from: self, to })
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        self.try_transition(to).is_ok()
    }

    /// Reads and writes may be issued in this state
    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Streaming)
    }

    /// A link is open or being opened
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Registering
                | SessionState::Authenticated
                | SessionState::Streaming
        )
    }
}
