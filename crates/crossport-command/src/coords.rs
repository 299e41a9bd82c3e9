//! Coordinate tokens and position resolution.
//!
//! A coordinate token is empty, `~`, `~<offset>`, or a plain number. Empty and
//! bare `~` keep the reference axis unchanged.

use crossport_api::Position;

use crate::CommandError;

/// Usage shown when the coordinate form of `/tp` is malformed.
pub const POSITION_USAGE: &str = "/tp <target> <x> <y> <z> [world] [server]";

/// One parsed coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordArg {
    /// Offset from the reference axis. `~` and empty are `Relative(0.0)`.
    Relative(f64),
    Absolute(f64),
}

impl CoordArg {
    pub fn resolve(self, base: f64) -> f64 {
        match self {
            CoordArg::Relative(offset) => base + offset,
            CoordArg::Absolute(value) => value,
        }
    }
}

/// Parse a single coordinate token. Returns `None` if it is not one.
pub fn parse_coord(token: &str) -> Option<CoordArg> {
    let token = token.trim();
    if let Some(rest) = token.strip_prefix('~') {
        if rest.is_empty() {
            return Some(CoordArg::Relative(0.0));
        }
        return parse_finite(rest).map(CoordArg::Relative);
    }
    if token.is_empty() {
        return Some(CoordArg::Relative(0.0));
    }
    parse_finite(token).map(CoordArg::Absolute)
}

/// Whether `token` is a valid coordinate token.
pub fn is_coordinate(token: &str) -> bool {
    parse_coord(token).is_some()
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Resolve `tokens` (`x y [z] [world] [node]`) against `reference`.
///
/// A missing `z` counts as an empty token. World and node names are carried
/// through as given; whether they exist is decided when the teleport runs.
pub fn resolve_position(reference: &Position, tokens: &[String]) -> Result<Position, CommandError> {
    if !(2..=5).contains(&tokens.len()) {
        return Err(CommandError::InvalidSyntax {
            usage: POSITION_USAGE,
        });
    }

    let axis = |i: usize| {
        let token = tokens.get(i).map(String::as_str).unwrap_or("");
        parse_coord(token).ok_or(CommandError::InvalidSyntax {
            usage: POSITION_USAGE,
        })
    };
    let x = axis(0)?;
    let y = axis(1)?;
    let z = axis(2)?;

    Ok(Position {
        x: x.resolve(reference.x),
        y: y.resolve(reference.y),
        z: z.resolve(reference.z),
        orientation: reference.orientation,
        world: tokens
            .get(3)
            .cloned()
            .unwrap_or_else(|| reference.world.clone()),
        node: tokens
            .get(4)
            .cloned()
            .unwrap_or_else(|| reference.node.clone()),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
