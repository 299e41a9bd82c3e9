//! `/tp` argument disambiguation.
//!
//! Forms accepted (1–6 tokens):
//! - `/tp <player>`: invoker to player
//! - `/tp <player> <player>`: first to second
//! - `/tp <x> <y> <z> [world] [server]`: invoker to position
//! - `/tp <player> <x> <y> <z> [world] [server]`: player to position

use crossport_api::{permission, Position};

use crate::coords::{is_coordinate, resolve_position};
use crate::{CommandError, Invoker};

/// Usage shown when the token count is wrong.
pub const USAGE: &str = "/tp <target> [destination]";

/// What a `/tp` command resolved to. Exactly one of the two forms.
#[derive(Debug, Clone, PartialEq)]
pub enum TeleportTarget {
    Player { teleportee: String, target: String },
    Position { teleportee: String, position: Position },
}

impl TeleportTarget {
    pub fn teleportee(&self) -> &str {
        match self {
            TeleportTarget::Player { teleportee, .. }
            | TeleportTarget::Position { teleportee, .. } => teleportee,
        }
    }
}

/// Resolve raw `/tp` arguments for `invoker`.
///
/// Token count and permission are checked before any coordinate is parsed.
pub fn resolve_target(
    invoker: &dyn Invoker,
    args: &[String],
) -> Result<TeleportTarget, CommandError> {
    if args.is_empty() || args.len() > 6 {
        return Err(CommandError::InvalidSyntax { usage: USAGE });
    }

    if args.len() == 1 {
        return Ok(TeleportTarget::Player {
            teleportee: self_teleportee(invoker)?,
            target: args[0].clone(),
        });
    }

    if args.len() == 2 && !(is_coordinate(&args[0]) && is_coordinate(&args[1])) {
        return Ok(TeleportTarget::Player {
            teleportee: args[0].clone(),
            target: args[1].clone(),
        });
    }

    // Lookahead: a leading player name followed by three coordinates.
    let names_player = args.len() >= 4 && args[1..=3].iter().all(|t| is_coordinate(t));
    let (teleportee, coords) = if names_player {
        (args[0].clone(), &args[1..])
    } else {
        (self_teleportee(invoker)?, args)
    };

    if !invoker.has_permission(permission::TP_COORDINATES) {
        return Err(CommandError::NoPermission);
    }

    let reference = invoker
        .reference_position(&teleportee)
        .ok_or_else(|| CommandError::NoReference(teleportee.clone()))?;
    let position = resolve_position(&reference, coords)?;
    Ok(TeleportTarget::Position {
        teleportee,
        position,
    })
}

fn self_teleportee(invoker: &dyn Invoker) -> Result<String, CommandError> {
    if invoker.is_console() {
        Err(CommandError::ConsoleNotTeleportable)
    } else {
        Ok(invoker.name().to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
