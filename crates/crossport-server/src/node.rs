//! One cluster member: a simulated host wired to the cache, the teleport
//! coordinator and the session lifecycle, fed by its cluster inbox and the
//! console.

use std::sync::Arc;

use crossport_api::{permission, ClusterMessage, Database, Host, Position, User};
use crossport_command::{complete, parse_coord, resolve_target, CommandError, Invoker, TeleportTarget};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::cluster::LocalCluster;
use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorError, Dispatch, TeleportCoordinator};
use crate::lifecycle::{LifecycleSettings, SessionEvent, SessionLifecycle};
use crate::sim::SimHost;

const CONSOLE_HELP: &str = "join <player> | leave <player> | die <player> | respawn <player> | \
bed <player> <x> <y> <z> [world] | hazard <x> <y> <z> [world] | ignore <player> | \
homes <player> | grant <player> <permission> | revoke <player> <permission> | \
tp <args> | <player> tp <args> | tab <args> | who";

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("{0} is not connected to this node")]
    NotHere(String),
}

/// Offline-mode identity: stable for a given name.
pub fn offline_uuid(username: &str) -> Uuid {
    Uuid::new_v3(
        &Uuid::NAMESPACE_OID,
        format!("OfflinePlayer:{username}").as_bytes(),
    )
}

pub struct Node {
    name: String,
    host: Arc<SimHost>,
    db: Arc<dyn Database>,
    cluster: Arc<LocalCluster>,
    cache: Arc<Cache>,
    coordinator: Arc<TeleportCoordinator>,
    lifecycle: SessionLifecycle,
}

impl Node {
    /// Build the node and register it with the cluster, returning its inbox.
    pub fn start(
        name: &str,
        config: &ServerConfig,
        db: Arc<dyn Database>,
        cluster: Arc<LocalCluster>,
    ) -> (Arc<Self>, mpsc::Receiver<ClusterMessage>) {
        let host = Arc::new(SimHost::new(name, config));
        let cache = Arc::new(Cache::new(name));
        let spawn = host.spawn();
        let coordinator = Arc::new(TeleportCoordinator::new(
            spawn.clone(),
            config.cluster.enabled,
            host.clone(),
            db.clone(),
            cluster.clone(),
            cache.clone(),
        ));
        let lifecycle = SessionLifecycle::new(
            spawn,
            LifecycleSettings::from_config(config),
            host.clone(),
            db.clone(),
            cluster.clone(),
            cache.clone(),
            coordinator.clone(),
        );
        let inbox = cluster.join_node(name);

        let node = Arc::new(Self {
            name: name.to_string(),
            host,
            db,
            cluster,
            cache,
            coordinator,
            lifecycle,
        });
        (node, inbox)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &SimHost {
        &self.host
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[cfg(test)]
    pub fn coordinator(&self) -> &TeleportCoordinator {
        &self.coordinator
    }

    #[cfg(test)]
    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// Event loop: cluster inbox, console lines, shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<ClusterMessage>,
        mut console: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Node {} enabled", self.name);
        loop {
            tokio::select! {
                message = inbox.recv() => {
                    match message {
                        Some(m) => self.handle_message(m).await,
                        None => break,
                    }
                }
                Some(line) = console.recv() => {
                    let response = self.handle_console(&line).await;
                    if !response.is_empty() {
                        info!(target: "console", "[{}] {response}", self.name);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.cluster.leave_node(&self.name);
        info!("Node {} disabled", self.name);
    }

    pub async fn handle_message(&self, message: ClusterMessage) {
        match message {
            ClusterMessage::Roster(delta) => self.cache.apply_roster(delta),
            ClusterMessage::Directive(directive) => {
                if let Err(e) = self.coordinator.handle_directive(directive).await {
                    warn!("Directive failed on {}: {e}", self.name);
                }
            }
            ClusterMessage::Reply(reply) => {
                if let Err(e) = self.coordinator.receive_reply(reply).await {
                    warn!("Reply handling failed on {}: {e}", self.name);
                }
            }
            ClusterMessage::Notice { user, notice } => {
                self.coordinator.deliver_notice(&user, &notice)
            }
            ClusterMessage::Connect { user } => self.on_connect(user).await,
            ClusterMessage::Disconnect { user } => self.on_disconnect(user).await,
        }
    }

    async fn on_connect(&self, user: User) {
        let placed = match self.db.offline_position(user.uuid).await {
            Ok(position) => position,
            Err(e) => {
                warn!("No offline position for {}: {e}", user.username);
                None
            }
        };
        self.host.add_player(&user, placed);
        info!("{} joined {}", user.username, self.name);
        self.lifecycle.handle(&user, SessionEvent::Join).await;
    }

    async fn on_disconnect(&self, user: User) {
        self.lifecycle.handle(&user, SessionEvent::Leave).await;
        self.host.remove_player(user.uuid);
        info!("{} left {}", user.username, self.name);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Run `/tp` for a player on this node, or for the console when `sender`
    /// is `None`. Command errors are reported to the sender before returning.
    pub async fn tp(&self, sender: Option<&str>, args: &[String]) -> Result<Dispatch, NodeError> {
        let initiator = match sender {
            None => User::console(),
            Some(name) => self
                .host
                .find_user(name)
                .ok_or_else(|| NodeError::NotHere(name.to_string()))?,
        };

        let target = match self.resolve(&initiator, args) {
            Ok(target) => target,
            Err(e) => {
                debug!("/tp from {} rejected: {e}", initiator.username);
                self.coordinator.deliver_notice(&initiator, &e.notice());
                return Err(e.into());
            }
        };

        let dispatch = match target {
            TeleportTarget::Player { teleportee, target } => {
                self.coordinator
                    .teleport_to_player(&initiator, &teleportee, &target)
                    .await?
            }
            TeleportTarget::Position {
                teleportee,
                position,
            } => {
                self.coordinator
                    .teleport_to_position(&initiator, &teleportee, position)
                    .await?
            }
        };
        Ok(dispatch)
    }

    fn resolve(&self, initiator: &User, args: &[String]) -> Result<TeleportTarget, CommandError> {
        if initiator.is_console() {
            resolve_target(&ConsoleInvoker { host: &self.host }, args)
        } else {
            if !self.host.has_permission(initiator.uuid, permission::TP) {
                return Err(CommandError::NoPermission);
            }
            let invoker = PlayerInvoker {
                host: &self.host,
                user: initiator,
            };
            resolve_target(&invoker, args)
        }
    }

    /// Tab completion against every player known cluster-wide.
    pub fn complete(&self, args: &[String]) -> Vec<String> {
        let mut names = self.cache.online_names();
        names.extend(self.host.online_users().into_iter().map(|u| u.username));
        names.sort();
        names.dedup();
        complete(args, &names)
    }

    /// Toggle whether `user` ignores incoming teleport requests.
    pub async fn toggle_ignore(&self, user: &User) -> Result<bool, NodeError> {
        let ignoring = !self.cache.is_ignoring(user.uuid);
        self.db
            .set_ignore_flag(user.uuid, ignoring)
            .await
            .map_err(CoordinatorError::from)?;
        self.cache.set_ignoring(user.uuid, ignoring);
        Ok(ignoring)
    }

    /// One console line. Returns the text to echo back.
    pub async fn handle_console(&self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return String::new();
        };
        let args: Vec<String> = parts.map(String::from).collect();

        match (command, args.as_slice()) {
            ("help", _) => CONSOLE_HELP.to_string(),
            ("join", [name]) => {
                let user = User::new(offline_uuid(name), name.as_str());
                match self.cluster.connect(&user, &self.name).await {
                    Ok(()) => format!("Connecting {name} to {}", self.name),
                    Err(e) => format!("Could not connect {name}: {e}"),
                }
            }
            ("leave", [name]) => match self.local_user(name) {
                Ok(user) => match self.cluster.disconnect(&user).await {
                    Ok(()) => format!("Disconnecting {name}"),
                    Err(e) => format!("Could not disconnect {name}: {e}"),
                },
                Err(e) => e.to_string(),
            },
            ("die", [name]) => self.life_event(name, SessionEvent::Death).await,
            ("respawn", [name]) => match self.local_user(name) {
                Ok(user) => {
                    let at = self
                        .host
                        .bed_spawn(user.uuid)
                        .filter(|bed| bed.node == self.name)
                        .unwrap_or_else(|| self.host.spawn());
                    self.host.teleport(user.uuid, &at);
                    self.life_event(name, SessionEvent::Respawn).await
                }
                Err(e) => e.to_string(),
            },
            ("bed", [name, rest @ ..]) if (3..=4).contains(&rest.len()) => {
                let user = match self.local_user(name) {
                    Ok(user) => user,
                    Err(e) => return e.to_string(),
                };
                let Some(bed) = self.block_position(rest) else {
                    return "Usage: bed <player> <x> <y> <z> [world]".to_string();
                };
                self.host.set_bed(user.uuid, Some(bed.clone()));
                self.life_event(name, SessionEvent::SpawnPointUpdate(bed))
                    .await
            }
            ("hazard", rest) if (3..=4).contains(&rest.len()) => match self.block_position(rest) {
                Some(at) => {
                    self.host.mark_hazard(&at);
                    format!("Marked {at} unsafe")
                }
                None => "Usage: hazard <x> <y> <z> [world]".to_string(),
            },
            ("ignore", [name]) => {
                let user = match self.local_user(name) {
                    Ok(user) => user,
                    Err(e) => return e.to_string(),
                };
                match self.toggle_ignore(&user).await {
                    Ok(true) => format!("{name} now ignores teleport requests"),
                    Ok(false) => format!("{name} accepts teleport requests again"),
                    Err(e) => e.to_string(),
                }
            }
            ("homes", [name]) => match self.local_user(name) {
                Ok(user) => {
                    let homes = self.cache.homes(user.uuid).unwrap_or_default();
                    format!("Homes of {name}: {}", homes.join(", "))
                }
                Err(e) => e.to_string(),
            },
            ("grant" | "revoke", [name, perm]) => match self.local_user(name) {
                Ok(user) => {
                    if command == "grant" {
                        self.host.grant(user.uuid, perm);
                    } else {
                        self.host.revoke(user.uuid, perm);
                    }
                    format!("{command} {perm} for {name}")
                }
                Err(e) => e.to_string(),
            },
            ("tp", args) => self.tp_response(None, args).await,
            ("tab", args) => self.complete(args).join(" "),
            ("who", _) => {
                let here: Vec<String> = self
                    .host
                    .online_users()
                    .into_iter()
                    .map(|u| match self.lifecycle.state(u.uuid) {
                        Some(state) => format!("{} ({state:?})", u.username),
                        None => u.username,
                    })
                    .collect();
                let cluster = self.cache.online_names();
                format!(
                    "On {} ({}): {} | cluster: {}",
                    self.name,
                    here.len(),
                    here.join(", "),
                    cluster.join(", ")
                )
            }
            (sender, [tp, args @ ..]) if tp == "tp" => self.tp_response(Some(sender), args).await,
            _ => format!("Unknown command: {line}. Try: {CONSOLE_HELP}"),
        }
    }

    async fn tp_response(&self, sender: Option<&str>, args: &[String]) -> String {
        match self.tp(sender, args).await {
            Ok(Dispatch::Finished(outcome)) => format!("Teleport finished: {outcome:?}"),
            Ok(Dispatch::Dispatched(token)) => format!("Teleport {token} dispatched"),
            Ok(Dispatch::NotFound(name)) => format!("{name} is not online"),
            Err(e) => e.to_string(),
        }
    }

    async fn life_event(&self, name: &str, event: SessionEvent) -> String {
        match self.local_user(name) {
            Ok(user) => {
                let state = self.lifecycle.handle(&user, event).await;
                format!("{name} is now {state:?}")
            }
            Err(e) => e.to_string(),
        }
    }

    fn local_user(&self, name: &str) -> Result<User, NodeError> {
        self.host
            .find_user(name)
            .ok_or_else(|| NodeError::NotHere(name.to_string()))
    }

    /// Absolute `x y z [world]` on this node.
    fn block_position(&self, tokens: &[String]) -> Option<Position> {
        let mut axes = [0.0; 3];
        for (axis, token) in axes.iter_mut().zip(tokens) {
            *axis = parse_coord(token)?.resolve(0.0);
        }
        let world = tokens
            .get(3)
            .cloned()
            .unwrap_or_else(|| self.host.spawn().world);
        Some(Position::new(axes[0], axes[1], axes[2], world, self.name.as_str()))
    }
}

struct PlayerInvoker<'a> {
    host: &'a SimHost,
    user: &'a User,
}

impl Invoker for PlayerInvoker<'_> {
    fn name(&self) -> &str {
        &self.user.username
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.host.has_permission(self.user.uuid, permission)
    }

    fn reference_position(&self, _teleportee: &str) -> Option<Position> {
        self.host.position(self.user.uuid)
    }
}

/// The console may do anything but has no position of its own; coordinates
/// resolve against the teleportee, who must be on this node.
struct ConsoleInvoker<'a> {
    host: &'a SimHost,
}

impl Invoker for ConsoleInvoker<'_> {
    fn name(&self) -> &str {
        "CONSOLE"
    }

    fn has_permission(&self, _permission: &str) -> bool {
        true
    }

    fn reference_position(&self, teleportee: &str) -> Option<Position> {
        self.host
            .find_user(teleportee)
            .and_then(|user| self.host.position(user.uuid))
    }

    fn is_console(&self) -> bool {
        true
    }
}
