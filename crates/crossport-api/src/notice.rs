//! User-facing notices.
//!
//! Each notice has a stable locale key; the English text from `Display` is the
//! fallback when no locale file overrides it.

use serde::{Deserialize, Serialize};

use crate::TeleportOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    InvalidSyntax { usage: String },
    NoPermission,
    PlayerNotFound { name: String },
    TeleportComplete,
    TeleportingCrossNode { node: String },
    InvalidWorld,
    InvalidNode,
    IllegalCoordinates,
    UnsafeDestination,
    InvalidOnArrival,
    /// Bed missing or obstructed; the player was sent to the node spawn.
    SpawnNotValid,
    ReturnByDeathAvailable,
    IgnoringRequestsReminder,
}

impl Notice {
    /// Notice sent to the initiator once a teleport reaches `outcome`.
    pub fn for_outcome(outcome: TeleportOutcome) -> Self {
        match outcome {
            TeleportOutcome::CompletedLocally | TeleportOutcome::CompletedCrossNode => {
                Notice::TeleportComplete
            }
            TeleportOutcome::FailedInvalidWorld => Notice::InvalidWorld,
            TeleportOutcome::FailedInvalidNode => Notice::InvalidNode,
            TeleportOutcome::FailedIllegalCoordinates => Notice::IllegalCoordinates,
            TeleportOutcome::FailedUnsafe => Notice::UnsafeDestination,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Notice::InvalidSyntax { .. } => "error_invalid_syntax",
            Notice::NoPermission => "error_no_permission",
            Notice::PlayerNotFound { .. } => "error_player_not_found",
            Notice::TeleportComplete => "teleporting_complete",
            Notice::TeleportingCrossNode { .. } => "teleporting_other_server",
            Notice::InvalidWorld => "error_invalid_world",
            Notice::InvalidNode => "error_invalid_server",
            Notice::IllegalCoordinates => "error_illegal_target_coordinates",
            Notice::UnsafeDestination => "error_unsafe_destination",
            Notice::InvalidOnArrival => "error_invalid_on_arrival",
            Notice::SpawnNotValid => "block.minecraft.spawn.not_valid",
            Notice::ReturnByDeathAvailable => "return_by_death_notification",
            Notice::IgnoringRequestsReminder => "tpignore_on_notification",
        }
    }

    /// Informational notices are not failures.
    pub fn is_error(&self) -> bool {
        self.key().starts_with("error_")
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::InvalidSyntax { usage } => write!(f, "Invalid syntax. Usage: {usage}"),
            Notice::NoPermission => f.write_str("You do not have permission to do that"),
            Notice::PlayerNotFound { name } => write!(f, "Player not found: {name}"),
            Notice::TeleportComplete => f.write_str("Teleported!"),
            Notice::TeleportingCrossNode { node } => write!(f, "Teleporting you to {node}..."),
            Notice::InvalidWorld => f.write_str("That world does not exist"),
            Notice::InvalidNode => f.write_str("That server is not available"),
            Notice::IllegalCoordinates => f.write_str("Those coordinates are outside the world"),
            Notice::UnsafeDestination => f.write_str("That destination is not safe"),
            Notice::InvalidOnArrival => {
                f.write_str("The teleport destination was no longer valid when you arrived")
            }
            Notice::SpawnNotValid => {
                f.write_str("You have no home bed or respawn anchor, or it was obstructed")
            }
            Notice::ReturnByDeathAvailable => {
                f.write_str("Use /back to return to where you died")
            }
            Notice::IgnoringRequestsReminder => {
                f.write_str("You are still ignoring teleport requests. Use /tpignore to toggle")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_notices_flag_failures() {
        for outcome in TeleportOutcome::ALL {
            let notice = Notice::for_outcome(outcome);
            assert_eq!(notice.is_error(), !outcome.successful(), "{outcome:?}");
        }
    }

    #[test]
    fn spawn_fallback_is_informational() {
        assert!(!Notice::SpawnNotValid.is_error());
        assert!(!Notice::ReturnByDeathAvailable.is_error());
    }

    #[test]
    fn not_found_names_player() {
        let notice = Notice::PlayerNotFound { name: "Bob".into() };
        assert_eq!(notice.to_string(), "Player not found: Bob");
        assert!(notice.is_error());
    }
}
