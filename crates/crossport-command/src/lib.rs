//! `/tp` command parsing: coordinate tokens, target disambiguation, tab completion.

pub mod coords;
pub mod target;

use crossport_api::{Notice, Position};
use thiserror::Error;

pub use coords::{is_coordinate, parse_coord, resolve_position, CoordArg, POSITION_USAGE};
pub use target::{resolve_target, TeleportTarget, USAGE};

/// Failures detected before any teleport work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid syntax, usage: {usage}")]
    InvalidSyntax { usage: &'static str },

    #[error("missing permission")]
    NoPermission,

    #[error("the console cannot be teleported")]
    ConsoleNotTeleportable,

    #[error("no reference position for {0}")]
    NoReference(String),
}

impl CommandError {
    /// Notice reported to whoever issued the command.
    pub fn notice(&self) -> Notice {
        match self {
            CommandError::InvalidSyntax { usage } => Notice::InvalidSyntax {
                usage: (*usage).to_string(),
            },
            CommandError::NoPermission => Notice::NoPermission,
            CommandError::ConsoleNotTeleportable => Notice::InvalidSyntax {
                usage: "/tp <player> <destination>".to_string(),
            },
            CommandError::NoReference(name) => Notice::PlayerNotFound { name: name.clone() },
        }
    }
}

/// Whoever issued the command: a player or the console.
pub trait Invoker {
    fn name(&self) -> &str;

    fn has_permission(&self, permission: &str) -> bool;

    /// Reference frame for relative coordinates when moving `teleportee`.
    ///
    /// Players use their own position; the console uses the teleportee's.
    fn reference_position(&self, teleportee: &str) -> Option<Position>;

    fn is_console(&self) -> bool {
        false
    }
}

/// Suggestions for the token currently being typed.
///
/// Player names are offered for the first two tokens, `~` for the coordinate
/// slots.
pub fn complete(args: &[String], online: &[String]) -> Vec<String> {
    let (index, partial) = match args.last() {
        Some(last) => (args.len() - 1, last.as_str()),
        None => (0, ""),
    };
    let lower = partial.to_lowercase();

    let mut suggestions: Vec<String> = Vec::new();
    if index < 2 {
        suggestions.extend(
            online
                .iter()
                .filter(|name| name.to_lowercase().starts_with(&lower))
                .cloned(),
        );
        suggestions.sort_by_key(|name| name.to_lowercase());
    }
    if index < 4 && "~".starts_with(partial) {
        suggestions.push("~".to_string());
    }
    suggestions
}

// ===========================================================================
// Tests
// ===========================================================================
