//! Enrollment state machine.
//!
//! ```text
//! Uninitialized → DerivingKey → IdentityReady → BundleWrapped → Enrolled
//!        └──────────────┴──────────────┴───────────────┴──────→ Failed
//! ```

use std::fmt;

use tracing::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Uninitialized,
    DerivingKey,
    IdentityReady,
    BundleWrapped,
    Enrolled,
    Failed,
}

impl EnrollmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentState::Enrolled | EnrollmentState::Failed)
    }

    pub fn can_transition_to(self, next: EnrollmentState) -> bool {
        use EnrollmentState::*;
        match (self, next) {
            (Uninitialized, DerivingKey)
            | (DerivingKey, IdentityReady)
            | (IdentityReady, BundleWrapped)
            | (BundleWrapped, Enrolled) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnrollmentState::Uninitialized => "uninitialized",
            EnrollmentState::DerivingKey => "deriving_key",
            EnrollmentState::IdentityReady => "identity_ready",
            EnrollmentState::BundleWrapped => "bundle_wrapped",
            EnrollmentState::Enrolled => "enrolled",
            EnrollmentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one enrollment attempt and logs every transition.
pub(crate) struct Machine<'a> {
    user_id: &'a str,
    state: EnrollmentState,
}

impl<'a> Machine<'a> {
    pub fn new(user_id: &'a str) -> Self {
        Self {
            user_id,
            state: EnrollmentState::Uninitialized,
        }
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn advance(&mut self, next: EnrollmentState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal enrollment transition {} -> {next}",
            self.state
        );
        debug!(user_id = self.user_id, from = %self.state, to = %next, "enrollment transition");
        self.state = next;
    }

    pub fn fail(&mut self, error: &Error) {
        warn!(
            user_id = self.user_id,
            at = %self.state,
            error = error.kind(),
            "enrollment failed"
        );
        self.state = EnrollmentState::Failed;
    }
}
