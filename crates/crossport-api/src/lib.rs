//! Shared teleport types and the collaborator traits the core talks to.
//!
//! Storage, inter-node messaging and the game host are all reached through
//! the traits defined here. This crate has no dependency on the command
//! parser or the server runtime.

mod notice;

pub use notice::Notice;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Permission nodes checked by the core.
pub mod permission {
    /// Base permission for `/tp`.
    pub const TP: &str = "crossport.command.tp";
    /// Required for the coordinate-destination form of `/tp`.
    pub const TP_COORDINATES: &str = "crossport.command.tp.coordinates";
    /// Allows returning to the last death position via `/back`.
    pub const BACK_RETURN_BY_DEATH: &str = "crossport.command.back.return_by_death";
}

// ─── Types ───────────────────────────────────────────────────────────────────

/// Facing direction attached to a position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f32,
    pub pitch: f32,
}

/// A point in a named world on a named node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub orientation: Option<Orientation>,
    pub world: String,
    pub node: String,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64, world: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            x,
            y,
            z,
            orientation: None,
            world: world.into(),
            node: node.into(),
        }
    }

    /// Same coordinates, moved onto another node.
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}, {:.1}, {:.1} in {} on {}",
            self.x, self.y, self.z, self.world, self.node
        )
    }
}

/// Stable identity of a player. Survives reconnects and node switches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub uuid: Uuid,
    pub username: String,
}

impl User {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
        }
    }

    /// The server console, used as the initiator of console commands.
    pub fn console() -> Self {
        Self::new(Uuid::nil(), "CONSOLE")
    }

    pub fn is_console(&self) -> bool {
        self.uuid.is_nil()
    }
}

/// Where a player is currently connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLocation {
    pub user: User,
    pub node: String,
}

/// Token tying a dispatched directive to the descriptor that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken(pub Uuid);

impl CorrelationToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a teleport ends up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Destination {
    Player(User),
    Position(Position),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Player(user) => f.write_str(&user.username),
            Destination::Position(position) => write!(f, "{position}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeleportKind {
    /// Requested by a command.
    Ordinary,
    /// Derived from a bed or respawn point after death.
    Respawn,
}

/// Durable marker of a teleport that may have to be resumed on another node.
///
/// Keyed in storage by the teleportee; at most one exists per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportDescriptor {
    pub token: CorrelationToken,
    pub initiator: User,
    pub teleportee: User,
    pub destination: Destination,
    pub kind: TeleportKind,
    /// Node that created the descriptor and awaits directive results.
    pub origin_node: String,
    pub created_at: DateTime<Utc>,
}

impl TeleportDescriptor {
    pub fn new(
        initiator: User,
        teleportee: User,
        destination: Destination,
        kind: TeleportKind,
        origin_node: impl Into<String>,
    ) -> Self {
        Self {
            token: CorrelationToken::generate(),
            initiator,
            teleportee,
            destination,
            kind,
            origin_node: origin_node.into(),
            created_at: Utc::now(),
        }
    }
}

/// Closed set of ways a teleport can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeleportOutcome {
    CompletedLocally,
    CompletedCrossNode,
    FailedInvalidWorld,
    FailedInvalidNode,
    FailedIllegalCoordinates,
    FailedUnsafe,
}

impl TeleportOutcome {
    pub const ALL: [TeleportOutcome; 6] = [
        TeleportOutcome::CompletedLocally,
        TeleportOutcome::CompletedCrossNode,
        TeleportOutcome::FailedInvalidWorld,
        TeleportOutcome::FailedInvalidNode,
        TeleportOutcome::FailedIllegalCoordinates,
        TeleportOutcome::FailedUnsafe,
    ];

    pub fn successful(self) -> bool {
        match self {
            TeleportOutcome::CompletedLocally | TeleportOutcome::CompletedCrossNode => true,
            TeleportOutcome::FailedInvalidWorld
            | TeleportOutcome::FailedInvalidNode
            | TeleportOutcome::FailedIllegalCoordinates
            | TeleportOutcome::FailedUnsafe => false,
        }
    }
}

// ─── Cluster messages ────────────────────────────────────────────────────────

/// Snapshot of the players connected to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterDelta {
    pub node: String,
    pub players: Vec<User>,
}

/// Asks a node to carry out a teleport for a player it hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportDirective {
    pub descriptor: TeleportDescriptor,
}

/// Reply to a [`TeleportDirective`], sent to the descriptor's origin node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportReply {
    pub token: CorrelationToken,
    pub teleportee: Uuid,
    pub outcome: TeleportOutcome,
}

/// Everything a node can receive from the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    Roster(RosterDelta),
    Directive(TeleportDirective),
    Reply(TeleportReply),
    /// A notice for a user (or the console) hosted by the receiving node.
    Notice { user: User, notice: Notice },
    /// The proxy routed a player onto the receiving node.
    Connect { user: User },
    /// The proxy moved a player off the receiving node.
    Disconnect { user: User },
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no record for user {0}")]
    UnknownUser(Uuid),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} is not reachable")]
    Unreachable(String),

    #[error("player {0} is not connected to the cluster")]
    NotConnected(String),

    #[error("channel to node {0} is closed")]
    ChannelClosed(String),
}

// ─── Collaborators ───────────────────────────────────────────────────────────

/// Durable per-user storage shared by every node of the cluster.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create the user's record if it does not exist yet. Idempotent.
    async fn ensure_user(&self, user: &User) -> Result<(), StoreError>;

    async fn ignore_flag(&self, uuid: Uuid) -> Result<Option<bool>, StoreError>;
    async fn set_ignore_flag(&self, uuid: Uuid, ignoring: bool) -> Result<(), StoreError>;

    /// Home names in storage order.
    async fn home_names(&self, uuid: Uuid) -> Result<Vec<String>, StoreError>;

    async fn pending_teleport(&self, uuid: Uuid) -> Result<Option<TeleportDescriptor>, StoreError>;
    async fn set_pending_teleport(
        &self,
        uuid: Uuid,
        descriptor: Option<TeleportDescriptor>,
    ) -> Result<(), StoreError>;

    /// Clear the pending teleport only if it still carries `token`, as one
    /// atomic step. Returns whether anything was cleared.
    async fn clear_pending_teleport_if(
        &self,
        uuid: Uuid,
        token: CorrelationToken,
    ) -> Result<bool, StoreError>;

    async fn respawn_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError>;
    async fn set_respawn_position(
        &self,
        uuid: Uuid,
        position: Option<Position>,
    ) -> Result<(), StoreError>;

    async fn offline_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError>;
    async fn set_offline_position(&self, uuid: Uuid, position: Position) -> Result<(), StoreError>;

    async fn last_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError>;
    async fn set_last_position(&self, uuid: Uuid, position: Position) -> Result<(), StoreError>;
}

/// Inter-node messaging and the proxy's view of who is connected where.
///
/// Delivery and ordering are whatever the transport provides; nothing here
/// retries.
#[async_trait]
pub trait ClusterMessenger: Send + Sync {
    /// Fire-and-forget roster snapshot to every other node, carried over the
    /// proxy connection of `via`, who must be connected to `delta.node`.
    async fn broadcast_roster(&self, delta: RosterDelta, via: &User) -> Result<(), ClusterError>;

    async fn send_directive(
        &self,
        node: &str,
        directive: TeleportDirective,
    ) -> Result<(), ClusterError>;

    async fn send_reply(&self, node: &str, reply: TeleportReply) -> Result<(), ClusterError>;

    async fn relay_notice(&self, node: &str, user: &User, notice: Notice)
        -> Result<(), ClusterError>;

    /// Authoritative cluster-wide lookup by username (case-insensitive).
    async fn locate(&self, username: &str) -> Result<Option<PlayerLocation>, ClusterError>;

    fn is_reachable(&self, node: &str) -> bool;

    /// Ask the proxy to move a player's connection onto `node`.
    async fn transfer(&self, user: &User, node: &str) -> Result<(), ClusterError>;
}

/// The game server process a node runs inside.
///
/// Calls are synchronous; the host applies them on its own loop.
pub trait Host: Send + Sync {
    fn online_users(&self) -> Vec<User>;

    /// Case-insensitive lookup among players on this node.
    fn find_user(&self, username: &str) -> Option<User>;

    fn is_online(&self, uuid: Uuid) -> bool {
        self.online_users().iter().any(|u| u.uuid == uuid)
    }

    fn position(&self, uuid: Uuid) -> Option<Position>;
    fn bed_spawn(&self, uuid: Uuid) -> Option<Position>;
    fn has_permission(&self, uuid: Uuid, permission: &str) -> bool;

    fn world_exists(&self, world: &str) -> bool;
    fn within_bounds(&self, position: &Position) -> bool;
    fn is_safe(&self, position: &Position) -> bool;

    /// Move a player on this node. Returns `false` if the player is gone.
    fn teleport(&self, uuid: Uuid, position: &Position) -> bool;

    fn send_notice(&self, uuid: Uuid, notice: &Notice);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User::new(Uuid::new_v4(), "Alice")
    }

    #[test]
    fn successful_only_for_completed() {
        for outcome in TeleportOutcome::ALL {
            let expected = matches!(
                outcome,
                TeleportOutcome::CompletedLocally | TeleportOutcome::CompletedCrossNode
            );
            assert_eq!(outcome.successful(), expected, "{outcome:?}");
        }
    }

    #[test]
    fn descriptor_tokens_are_unique() {
        let a = TeleportDescriptor::new(
            alice(),
            alice(),
            Destination::Position(Position::new(0.0, 64.0, 0.0, "world", "lobby")),
            TeleportKind::Ordinary,
            "lobby",
        );
        let b = TeleportDescriptor::new(
            a.initiator.clone(),
            a.teleportee.clone(),
            a.destination.clone(),
            TeleportKind::Ordinary,
            "lobby",
        );
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn descriptor_survives_json() {
        let d = TeleportDescriptor::new(
            User::console(),
            alice(),
            Destination::Player(User::new(Uuid::new_v4(), "Bob")),
            TeleportKind::Respawn,
            "survival",
        );
        let json = serde_json::to_string(&d).unwrap();
        let back: TeleportDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn console_identity() {
        assert!(User::console().is_console());
        assert!(!alice().is_console());
    }

    #[test]
    fn position_display_and_node_move() {
        let p = Position::new(10.0, 64.5, -3.3, "world", "lobby").on_node("survival");
        assert_eq!(p.node, "survival");
        assert_eq!(p.to_string(), "10.0, 64.5, -3.3 in world on survival");
    }

    #[test]
    fn destination_display() {
        let d = Destination::Player(User::new(Uuid::nil(), "Bob"));
        assert_eq!(d.to_string(), "Bob");
    }

    // Minimal Host used to check the provided `is_online` default.
    struct OnePlayerHost(User);

    impl Host for OnePlayerHost {
        fn online_users(&self) -> Vec<User> {
            vec![self.0.clone()]
        }
        fn find_user(&self, username: &str) -> Option<User> {
            self.0
                .username
                .eq_ignore_ascii_case(username)
                .then(|| self.0.clone())
        }
        fn position(&self, _uuid: Uuid) -> Option<Position> {
            None
        }
        fn bed_spawn(&self, _uuid: Uuid) -> Option<Position> {
            None
        }
        fn has_permission(&self, _uuid: Uuid, _permission: &str) -> bool {
            true
        }
        fn world_exists(&self, _world: &str) -> bool {
            true
        }
        fn within_bounds(&self, _position: &Position) -> bool {
            true
        }
        fn is_safe(&self, _position: &Position) -> bool {
            true
        }
        fn teleport(&self, _uuid: Uuid, _position: &Position) -> bool {
            false
        }
        fn send_notice(&self, _uuid: Uuid, _notice: &Notice) {}
    }

    #[test]
    fn host_is_online_default() {
        let user = alice();
        let host = OnePlayerHost(user.clone());
        assert!(host.is_online(user.uuid));
        assert!(!host.is_online(Uuid::new_v4()));
        assert_eq!(host.find_user("alice"), Some(user));
    }
}
