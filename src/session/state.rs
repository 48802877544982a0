//! Session lifecycle state

use std::fmt;

/// ```text
/// Disconnected -> Connecting -> Connected <-> ShellActive
///       ^              |            |              |
///       +--------------+------------+--------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected with an interactive shell open
    ShellActive,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::ShellActive)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, ShellActive)
                | (ShellActive, Connected)
                | (Connected, Disconnected)
                | (ShellActive, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::ShellActive => "shell-active",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(ShellActive));
        assert!(ShellActive.can_transition_to(Connected));
        assert!(ShellActive.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(ShellActive));
        assert!(!Connecting.can_transition_to(ShellActive));
    }
}
