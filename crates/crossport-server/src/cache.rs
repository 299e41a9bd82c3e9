//! Process-local mirror of cluster rosters, home names and the ignore table.
//!
//! Best effort only: storage and the proxy stay authoritative.

use std::collections::{HashMap, HashSet};

use crossport_api::{PlayerLocation, RosterDelta, User};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

pub struct Cache {
    node: String,
    homes: RwLock<HashMap<Uuid, Vec<String>>>,
    rosters: RwLock<HashMap<String, Vec<User>>>,
    ignoring: RwLock<HashSet<Uuid>>,
}

impl Cache {
    /// Created once per node at start-up; `node` is this node's identity.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            homes: RwLock::new(HashMap::new()),
            rosters: RwLock::new(HashMap::new()),
            ignoring: RwLock::new(HashSet::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    // --- Homes ---

    pub fn set_homes(&self, uuid: Uuid, names: Vec<String>) {
        self.homes.write().insert(uuid, names);
    }

    pub fn homes(&self, uuid: Uuid) -> Option<Vec<String>> {
        self.homes.read().get(&uuid).cloned()
    }

    /// Drop everything held for a user who left this node.
    pub fn evict(&self, uuid: Uuid) {
        self.homes.write().remove(&uuid);
        self.ignoring.write().remove(&uuid);
        if let Some(roster) = self.rosters.write().get_mut(&self.node) {
            roster.retain(|u| u.uuid != uuid);
        }
    }

    // --- Rosters ---

    /// Replace a node's roster. Deltas for this node from elsewhere are ignored.
    pub fn apply_roster(&self, delta: RosterDelta) {
        if delta.node == self.node {
            debug!("Ignoring roster for own node {}", self.node);
            return;
        }
        self.rosters.write().insert(delta.node, delta.players);
    }

    pub fn set_own_roster(&self, players: Vec<User>) {
        self.rosters.write().insert(self.node.clone(), players);
    }

    /// Fast-path lookup; may be stale.
    pub fn locate(&self, username: &str) -> Option<PlayerLocation> {
        let rosters = self.rosters.read();
        // Own node first, its roster is the freshest.
        let own = rosters.get_key_value(self.node.as_str());
        own.into_iter()
            .chain(rosters.iter().filter(|(node, _)| **node != self.node))
            .find_map(|(node, players)| {
                players
                    .iter()
                    .find(|u| u.username.eq_ignore_ascii_case(username))
                    .map(|user| PlayerLocation {
                        user: user.clone(),
                        node: node.clone(),
                    })
            })
    }

    /// Every cached player name across the cluster, for tab completion.
    pub fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rosters
            .read()
            .values()
            .flatten()
            .map(|u| u.username.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    // --- Request routing ---

    pub fn set_ignoring(&self, uuid: Uuid, ignoring: bool) {
        let mut table = self.ignoring.write();
        if ignoring {
            table.insert(uuid);
        } else {
            table.remove(&uuid);
        }
    }

    /// Whether incoming teleport requests to `uuid` are suppressed.
    pub fn is_ignoring(&self, uuid: Uuid) -> bool {
        self.ignoring.read().contains(&uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User::new(Uuid::new_v4(), name)
    }

    #[test]
    fn locate_prefers_own_node() {
        let cache = Cache::new("lobby");
        let alice = user("Alice");
        cache.apply_roster(RosterDelta {
            node: "survival".into(),
            players: vec![alice.clone()],
        });
        assert_eq!(cache.locate("alice").unwrap().node, "survival");

        cache.set_own_roster(vec![alice.clone()]);
        assert_eq!(cache.locate("ALICE").unwrap().node, "lobby");
        assert!(cache.locate("Bob").is_none());
    }

    #[test]
    fn foreign_delta_for_own_node_is_ignored() {
        let cache = Cache::new("lobby");
        cache.set_own_roster(vec![user("Alice")]);
        cache.apply_roster(RosterDelta {
            node: "lobby".into(),
            players: vec![],
        });
        assert!(cache.locate("Alice").is_some());
    }

    #[test]
    fn evict_clears_user_state() {
        let cache = Cache::new("lobby");
        let alice = user("Alice");
        cache.set_own_roster(vec![alice.clone()]);
        cache.set_homes(alice.uuid, vec!["base".into()]);
        cache.set_ignoring(alice.uuid, true);

        cache.evict(alice.uuid);
        assert!(cache.homes(alice.uuid).is_none());
        assert!(!cache.is_ignoring(alice.uuid));
        assert!(cache.locate("Alice").is_none());
    }

    #[test]
    fn online_names_are_sorted_and_unique() {
        let cache = Cache::new("lobby");
        let bob = user("Bob");
        cache.set_own_roster(vec![bob.clone(), user("Alice")]);
        cache.apply_roster(RosterDelta {
            node: "survival".into(),
            players: vec![bob],
        });
        assert_eq!(cache.online_names(), vec!["Alice", "Bob"]);
    }

    #[test]
    fn ignore_toggle() {
        let cache = Cache::new("lobby");
        let id = Uuid::new_v4();
        cache.set_ignoring(id, true);
        assert!(cache.is_ignoring(id));
        cache.set_ignoring(id, false);
        assert!(!cache.is_ignoring(id));
    }
}
