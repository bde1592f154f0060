//! Lease state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a lease is in its life.
///
/// `Pending → Reserved → Allocated → Deployed → Active`, and from any
/// live state `→ Closing → Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Reserved,
    Allocated,
    Deployed,
    Active,
    Closing,
    Released,
}

impl LeaseState {
    pub fn can_transition_to(self, next: LeaseState) -> bool {
        use LeaseState::*;
        match (self, next) {
            (Pending, Reserved)
            | (Reserved, Allocated)
            | (Allocated, Deployed)
            | (Deployed, Active)
            | (Closing, Released) => true,
            (Released, _) | (Closing, _) => false,
            (_, Closing) => true,
            _ => false,
        }
    }

    /// Whether backend state may exist for the lease.
    pub fn has_workloads(self) -> bool {
        matches!(self, LeaseState::Deployed | LeaseState::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Closing | LeaseState::Released)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseState::Pending => "pending",
            LeaseState::Reserved => "reserved",
            LeaseState::Allocated => "allocated",
            LeaseState::Deployed => "deployed",
            LeaseState::Active => "active",
            LeaseState::Closing => "closing",
            LeaseState::Released => "released",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LeaseState::*;

    const ALL: [LeaseState; 7] = [Pending, Reserved, Allocated, Deployed, Active, Closing, Released];

    #[test]
    fn forward_path() {
        assert!(Pending.can_transition_to(Reserved));
        assert!(Reserved.can_transition_to(Allocated));
        assert!(Allocated.can_transition_to(Deployed));
        assert!(Deployed.can_transition_to(Active));
    }

    #[test]
    fn no_skipping_or_going_back() {
        assert!(!Pending.can_transition_to(Allocated));
        assert!(!Reserved.can_transition_to(Deployed));
        assert!(!Allocated.can_transition_to(Active));
        assert!(!Active.can_transition_to(Deployed));
        assert!(!Deployed.can_transition_to(Reserved));
    }

    #[test]
    fn every_live_state_can_close() {
        for state in ALL {
            let live = !state.is_terminal();
            assert_eq!(state.can_transition_to(Closing), live, "{state}");
        }
        assert!(Closing.can_transition_to(Released));
        for state in ALL {
            assert!(!Released.can_transition_to(state));
        }
    }

    #[test]
    fn serde_snake_case() {
        assert_eq!(serde_json::to_string(&Active).unwrap(), "\"active\"");
    }
}
