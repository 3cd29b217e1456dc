use std::fmt;

/// Lifecycle of a session.
///
/// ```text
/// Birth -> Handshake -> Confirmed -> Active <-> Inactive
///                  \__ (resume) __/    any -> Death
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Birth,
    Handshake,
    Confirmed,
    Active,
    Inactive,
    Death,
}

impl SessionState {
    /// Settings may only change before traffic starts flowing.
    pub fn settings_mutable(self) -> bool {
        matches!(self, SessionState::Birth | SessionState::Handshake | SessionState::Confirmed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Birth => "birth",
            SessionState::Handshake => "handshake",
            SessionState::Confirmed => "confirmed",
            SessionState::Active => "active",
            SessionState::Inactive => "inactive",
            SessionState::Death => "death",
        })
    }
}

/// A state transition, as delivered to gate watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub session_id: String,
    pub user_id: String,
    pub old: SessionState,
    pub new: SessionState,
}
