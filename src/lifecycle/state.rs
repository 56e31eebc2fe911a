use std::fmt;

/// Where one handoff generation stands.
///
/// `Empty -> Published -> Consumed -> Cleaned`, with `Failed` reachable when consumers do
/// not show up in time or cleanup does not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffState {
    Empty,
    Published,
    Consumed,
    Cleaned,
    /// Terminal. The artifact needs an operator.
    Failed,
}

impl HandoffState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandoffState::Empty => "empty",
            HandoffState::Published => "published",
            HandoffState::Consumed => "consumed",
            HandoffState::Cleaned => "cleaned",
            HandoffState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandoffState::Cleaned | HandoffState::Failed)
    }

    /// A durable artifact may still exist at the location.
    pub fn holds_artifact(self) -> bool {
        matches!(
            self,
            HandoffState::Published | HandoffState::Consumed | HandoffState::Failed
        )
    }

    pub fn can_transition_to(self, next: HandoffState) -> bool {
        use HandoffState::*;
        matches!(
            (self, next),
            (Empty, Published)
                | (Published, Consumed)
                | (Consumed, Cleaned)
                | (Published, Failed)
                | (Consumed, Failed)
        )
    }
}

impl fmt::Display for HandoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
