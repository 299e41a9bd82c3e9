//! Simulated game host backing each in-process node.
//!
//! Tracks connected players, their positions, beds and permissions, and
//! applies the world rules configured in `[[worlds]]`.

use std::collections::{HashMap, HashSet};

use crossport_api::{Host, Notice, Position, User};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::{ServerConfig, WorldSection};

struct SimPlayer {
    user: User,
    position: Position,
    permissions: HashSet<String>,
}

#[derive(Default)]
struct SimState {
    players: HashMap<Uuid, SimPlayer>,
    /// Bed spawns outlive sessions, like any other player data.
    beds: HashMap<Uuid, Position>,
    /// Block coordinates (world, x, y, z) a player must not be placed at.
    hazards: HashSet<(String, i64, i64, i64)>,
    notices: Vec<(Uuid, Notice)>,
}

pub struct SimHost {
    node: String,
    spawn: Position,
    worlds: HashMap<String, WorldSection>,
    operators: HashSet<String>,
    default_permissions: Vec<String>,
    state: Mutex<SimState>,
}

impl SimHost {
    pub fn new(node: &str, config: &ServerConfig) -> Self {
        Self {
            node: node.to_string(),
            spawn: config.node.spawn.position(node),
            worlds: config
                .worlds
                .iter()
                .map(|w| (w.name.clone(), w.clone()))
                .collect(),
            operators: config
                .permissions
                .operators
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            default_permissions: config.permissions.defaults.clone(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn spawn(&self) -> Position {
        self.spawn.clone()
    }

    /// Place a newly connected player at `position` (or the node spawn).
    pub fn add_player(&self, user: &User, position: Option<Position>) {
        let position = position
            .filter(|p| p.node == self.node)
            .unwrap_or_else(|| self.spawn.clone());
        let permissions = self.default_permissions.iter().cloned().collect();
        self.state.lock().players.insert(
            user.uuid,
            SimPlayer {
                user: user.clone(),
                position,
                permissions,
            },
        );
    }

    /// Remove a player, returning where they were.
    pub fn remove_player(&self, uuid: Uuid) -> Option<Position> {
        self.state.lock().players.remove(&uuid).map(|p| p.position)
    }

    pub fn set_bed(&self, uuid: Uuid, bed: Option<Position>) {
        let mut state = self.state.lock();
        match bed {
            Some(bed) => state.beds.insert(uuid, bed),
            None => state.beds.remove(&uuid),
        };
    }

    pub fn grant(&self, uuid: Uuid, permission: &str) {
        if let Some(player) = self.state.lock().players.get_mut(&uuid) {
            player.permissions.insert(permission.to_string());
        }
    }

    pub fn revoke(&self, uuid: Uuid, permission: &str) {
        if let Some(player) = self.state.lock().players.get_mut(&uuid) {
            player.permissions.remove(permission);
        }
    }

    pub fn mark_hazard(&self, position: &Position) {
        self.state.lock().hazards.insert(block_key(position));
    }

    /// Notices delivered to `uuid`, oldest first.
    pub fn notices_for(&self, uuid: Uuid) -> Vec<Notice> {
        self.state
            .lock()
            .notices
            .iter()
            .filter(|(id, _)| *id == uuid)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

fn block_key(position: &Position) -> (String, i64, i64, i64) {
    (
        position.world.clone(),
        position.x.floor() as i64,
        position.y.floor() as i64,
        position.z.floor() as i64,
    )
}

impl Host for SimHost {
    fn online_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .state
            .lock()
            .players
            .values()
            .map(|p| p.user.clone())
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    fn find_user(&self, username: &str) -> Option<User> {
        self.state
            .lock()
            .players
            .values()
            .find(|p| p.user.username.eq_ignore_ascii_case(username))
            .map(|p| p.user.clone())
    }

    fn position(&self, uuid: Uuid) -> Option<Position> {
        self.state.lock().players.get(&uuid).map(|p| p.position.clone())
    }

    fn bed_spawn(&self, uuid: Uuid) -> Option<Position> {
        self.state.lock().beds.get(&uuid).cloned()
    }

    fn has_permission(&self, uuid: Uuid, permission: &str) -> bool {
        let state = self.state.lock();
        match state.players.get(&uuid) {
            Some(p) => {
                self.operators.contains(&p.user.username.to_lowercase())
                    || p.permissions.contains(permission)
            }
            None => false,
        }
    }

    fn world_exists(&self, world: &str) -> bool {
        self.worlds.contains_key(world)
    }

    fn within_bounds(&self, position: &Position) -> bool {
        match self.worlds.get(&position.world) {
            Some(w) => {
                position.x.abs() <= w.border_radius
                    && position.z.abs() <= w.border_radius
                    && position.y >= w.min_y
                    && position.y <= w.max_y
            }
            None => false,
        }
    }

    fn is_safe(&self, position: &Position) -> bool {
        !self.state.lock().hazards.contains(&block_key(position))
    }

    fn teleport(&self, uuid: Uuid, position: &Position) -> bool {
        match self.state.lock().players.get_mut(&uuid) {
            Some(player) => {
                player.position = position.clone().on_node(self.node.clone());
                true
            }
            None => false,
        }
    }

    fn send_notice(&self, uuid: Uuid, notice: &Notice) {
        let mut state = self.state.lock();
        let name = state
            .players
            .get(&uuid)
            .map(|p| p.user.username.clone())
            .unwrap_or_else(|| uuid.to_string());
        info!(target: "chat", "[{}] -> {name}: {notice}", self.node);
        state.notices.push((uuid, notice.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        toml::from_str(
            r#"
            [node]
            name = "lobby"

            [[worlds]]
            name = "world"
            border_radius = 100.0
            min_y = 0.0
            max_y = 256.0

            [permissions]
            operators = ["Admin"]

            [logging]
            level = "info"
        "#,
        )
        .unwrap()
    }

    #[test]
    fn bounds_follow_world_config() {
        let host = SimHost::new("lobby", &config());
        let inside = Position::new(50.0, 64.0, -99.0, "world", "lobby");
        let outside = Position::new(101.0, 64.0, 0.0, "world", "lobby");
        let too_low = Position::new(0.0, -1.0, 0.0, "world", "lobby");
        assert!(host.within_bounds(&inside));
        assert!(!host.within_bounds(&outside));
        assert!(!host.within_bounds(&too_low));
        assert!(!host.world_exists("nether"));
    }

    #[test]
    fn hazards_are_block_granular() {
        let host = SimHost::new("lobby", &config());
        host.mark_hazard(&Position::new(5.2, 64.0, 5.9, "world", "lobby"));
        assert!(!host.is_safe(&Position::new(5.7, 64.5, 5.1, "world", "lobby")));
        assert!(host.is_safe(&Position::new(6.0, 64.0, 5.0, "world", "lobby")));
    }

    #[test]
    fn operators_have_every_permission() {
        let host = SimHost::new("lobby", &config());
        let admin = User::new(Uuid::new_v4(), "admin");
        let guest = User::new(Uuid::new_v4(), "Guest");
        host.add_player(&admin, None);
        host.add_player(&guest, None);
        assert!(host.has_permission(admin.uuid, "anything"));
        assert!(host.has_permission(guest.uuid, crossport_api::permission::TP));
        assert!(!host.has_permission(guest.uuid, "anything"));
        host.grant(guest.uuid, "anything");
        assert!(host.has_permission(guest.uuid, "anything"));
        host.revoke(guest.uuid, "anything");
        assert!(!host.has_permission(guest.uuid, "anything"));
    }

    #[test]
    fn players_spawn_at_node_spawn_unless_placed_locally() {
        let host = SimHost::new("lobby", &config());
        let user = User::new(Uuid::new_v4(), "Alice");
        let elsewhere = Position::new(9.0, 9.0, 9.0, "world", "survival");
        host.add_player(&user, Some(elsewhere));
        assert_eq!(host.position(user.uuid), Some(host.spawn()));

        assert!(host.teleport(user.uuid, &Position::new(1.0, 2.0, 3.0, "world", "x")));
        assert_eq!(host.position(user.uuid).unwrap().node, "lobby");
        assert_eq!(host.remove_player(user.uuid).unwrap().x, 1.0);
        assert!(!host.teleport(user.uuid, &host.spawn()));
    }

    #[test]
    fn beds_survive_disconnects() {
        let host = SimHost::new("lobby", &config());
        let user = User::new(Uuid::new_v4(), "Alice");
        let bed = Position::new(3.0, 70.0, 3.0, "world", "lobby");
        host.add_player(&user, None);
        host.set_bed(user.uuid, Some(bed.clone()));
        host.remove_player(user.uuid);
        assert_eq!(host.bed_spawn(user.uuid), Some(bed));
        host.set_bed(user.uuid, None);
        assert!(host.bed_spawn(user.uuid).is_none());
    }
}
