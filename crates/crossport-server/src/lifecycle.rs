//! Per-player session state driven by host events.
//!
//! [`reduce`] is pure: it maps `(state, event, settings)` to the next state and
//! the effects to run. [`SessionLifecycle`] keeps the per-player state and
//! runs those effects in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossport_api::{
    permission, ClusterMessenger, Database, Host, Notice, PlayerLocation, Position, RosterDelta,
    TeleportKind, User,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorError, TeleportCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Joining,
    Active,
    Dying,
    /// Respawned and about to be sent to the node holding their respawn point.
    Respawning,
    Leaving,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Join,
    Leave,
    Death,
    Respawn,
    SpawnPointUpdate(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    EnsureUser,
    ResumePendingTeleport,
    BroadcastRoster,
    LoadIgnoreFlag,
    RefreshHomeCache,
    EvictCache,
    BroadcastRosterViaOther,
    SaveOfflinePosition,
    SaveDeathPosition,
    NotifyReturnByDeath,
    RespawnCrossNode,
    SaveRespawnPosition(Position),
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub cross_node: bool,
    pub global_respawning: bool,
    pub return_by_death: bool,
    pub respawn_lookup_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            cross_node: config.cluster.enabled,
            global_respawning: config.cluster.global_respawning,
            return_by_death: config.teleport.return_by_death,
            respawn_lookup_timeout: Duration::from_millis(config.teleport.respawn_lookup_timeout_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("storage error: {0}")]
    Store(#[from] crossport_api::StoreError),

    #[error("cluster error: {0}")]
    Cluster(#[from] crossport_api::ClusterError),
}

/// Next state and effects for `event`. Events that make no sense in the
/// current state leave it unchanged and produce nothing.
pub fn reduce(
    state: SessionState,
    event: &SessionEvent,
    settings: &LifecycleSettings,
) -> (SessionState, Vec<Effect>) {
    use SessionState::*;

    match (state, event) {
        (Joining | Leaving, SessionEvent::Join) => {
            let mut effects = vec![Effect::EnsureUser];
            if settings.cross_node {
                effects.push(Effect::ResumePendingTeleport);
                effects.push(Effect::BroadcastRoster);
            }
            effects.push(Effect::LoadIgnoreFlag);
            effects.push(Effect::RefreshHomeCache);
            (Active, effects)
        }
        (Leaving, _) => (Leaving, Vec::new()),
        (_, SessionEvent::Leave) => {
            let mut effects = vec![Effect::EvictCache];
            if settings.cross_node {
                effects.push(Effect::BroadcastRosterViaOther);
            }
            effects.push(Effect::SaveOfflinePosition);
            (Leaving, effects)
        }
        (Active | Respawning, SessionEvent::Death) => {
            let effects = if settings.return_by_death {
                vec![Effect::SaveDeathPosition]
            } else {
                Vec::new()
            };
            (Dying, effects)
        }
        (Dying, SessionEvent::Respawn) => {
            let mut effects = Vec::new();
            if settings.return_by_death {
                effects.push(Effect::NotifyReturnByDeath);
            }
            if settings.cross_node && settings.global_respawning {
                effects.push(Effect::RespawnCrossNode);
                (Respawning, effects)
            } else {
                (Active, effects)
            }
        }
        (Joining, SessionEvent::SpawnPointUpdate(_)) => (Joining, Vec::new()),
        (state, SessionEvent::SpawnPointUpdate(position)) => {
            let effects = if settings.cross_node && settings.global_respawning {
                vec![Effect::SaveRespawnPosition(position.clone())]
            } else {
                Vec::new()
            };
            (state, effects)
        }
        (state, event) => {
            trace!("Ignoring {event:?} in {state:?}");
            (state, Vec::new())
        }
    }
}

pub struct SessionLifecycle {
    node: String,
    spawn: Position,
    settings: LifecycleSettings,
    host: Arc<dyn Host>,
    db: Arc<dyn Database>,
    cluster: Arc<dyn ClusterMessenger>,
    cache: Arc<Cache>,
    coordinator: Arc<TeleportCoordinator>,
    sessions: Mutex<HashMap<Uuid, SessionState>>,
}

impl SessionLifecycle {
    pub fn new(
        spawn: Position,
        settings: LifecycleSettings,
        host: Arc<dyn Host>,
        db: Arc<dyn Database>,
        cluster: Arc<dyn ClusterMessenger>,
        cache: Arc<Cache>,
        coordinator: Arc<TeleportCoordinator>,
    ) -> Self {
        Self {
            node: cache.node().to_string(),
            spawn,
            settings,
            host,
            db,
            cluster,
            cache,
            coordinator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, uuid: Uuid) -> Option<SessionState> {
        self.sessions.lock().get(&uuid).copied()
    }

    /// Feed one host event through the reducer and run its effects.
    ///
    /// A failing effect is logged and the rest still run.
    pub async fn handle(&self, user: &User, event: SessionEvent) -> SessionState {
        let (next, effects) = {
            let mut sessions = self.sessions.lock();
            let current = sessions.get(&user.uuid).copied().unwrap_or_default();
            let (next, effects) = reduce(current, &event, &self.settings);
            if next == SessionState::Leaving {
                sessions.remove(&user.uuid);
            } else {
                sessions.insert(user.uuid, next);
            }
            (next, effects)
        };
        debug!("{} {event:?} -> {next:?} ({} effects)", user.username, effects.len());

        for effect in effects {
            if let Err(e) = self.run(user, &effect).await {
                match &e {
                    LifecycleError::Coordinator(CoordinatorError::Invariant(_)) => {
                        error!("{effect:?} for {} aborted: {e}", user.username)
                    }
                    _ => warn!("{effect:?} for {} failed: {e}", user.username),
                }
            }
        }
        next
    }

    async fn run(&self, user: &User, effect: &Effect) -> Result<(), LifecycleError> {
        let uuid = user.uuid;
        match effect {
            Effect::EnsureUser => self.db.ensure_user(user).await?,
            Effect::ResumePendingTeleport => {
                if let Some(outcome) = self.coordinator.resume(user).await? {
                    info!("Resumed teleport for {}: {outcome:?}", user.username);
                }
            }
            Effect::BroadcastRoster => self.broadcast_roster(None, user).await?,
            Effect::LoadIgnoreFlag => {
                let ignoring = self.db.ignore_flag(uuid).await?.unwrap_or(false);
                self.cache.set_ignoring(uuid, ignoring);
                if ignoring {
                    self.host.send_notice(uuid, &Notice::IgnoringRequestsReminder);
                }
            }
            Effect::RefreshHomeCache => {
                let homes = self.db.home_names(uuid).await?;
                self.cache.set_homes(uuid, homes);
            }
            Effect::EvictCache => self.cache.evict(uuid),
            Effect::BroadcastRosterViaOther => {
                // The leaver's connection is gone; someone still here has to carry it.
                let others: Vec<User> = self
                    .host
                    .online_users()
                    .into_iter()
                    .filter(|u| u.uuid != uuid)
                    .collect();
                let carrier = others.choose(&mut rand::thread_rng()).cloned();
                match carrier {
                    Some(carrier) => self.broadcast_roster(Some(uuid), &carrier).await?,
                    None => debug!("No one left on {} to carry a roster refresh", self.node),
                }
            }
            Effect::SaveOfflinePosition => {
                if let Some(position) = self.host.position(uuid) {
                    self.db.set_offline_position(uuid, position).await?;
                }
            }
            Effect::SaveDeathPosition => {
                if self.host.has_permission(uuid, permission::BACK_RETURN_BY_DEATH) {
                    if let Some(position) = self.host.position(uuid) {
                        self.db.set_last_position(uuid, position).await?;
                    }
                }
            }
            Effect::NotifyReturnByDeath => {
                if self.host.has_permission(uuid, permission::BACK_RETURN_BY_DEATH) {
                    self.host.send_notice(uuid, &Notice::ReturnByDeathAvailable);
                }
            }
            Effect::RespawnCrossNode => {
                let destination = self.respawn_destination(uuid).await;
                if destination.node == self.node {
                    trace!("{} respawns on {}", user.username, self.node);
                    if let Some(state) = self.sessions.lock().get_mut(&uuid) {
                        *state = SessionState::Active;
                    }
                } else {
                    let here = PlayerLocation {
                        user: user.clone(),
                        node: self.node.clone(),
                    };
                    self.coordinator
                        .teleport_user(user, here, destination, TeleportKind::Respawn)
                        .await?;
                }
            }
            Effect::SaveRespawnPosition(position) => {
                self.db
                    .set_respawn_position(uuid, Some(position.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Stored respawn point, bounded by the configured timeout.
    ///
    /// Falls back to this node's spawn when nothing usable comes back in time.
    async fn respawn_destination(&self, uuid: Uuid) -> Position {
        let lookup = self.db.respawn_position(uuid);
        match tokio::time::timeout(self.settings.respawn_lookup_timeout, lookup).await {
            Ok(Ok(Some(position))) => position,
            Ok(Ok(None)) => self.spawn.clone(),
            Ok(Err(e)) => {
                warn!("Respawn lookup failed: {e}");
                self.spawn.clone()
            }
            Err(_) => {
                warn!(
                    "Respawn lookup exceeded {:?}, using spawn",
                    self.settings.respawn_lookup_timeout
                );
                self.spawn.clone()
            }
        }
    }

    async fn broadcast_roster(&self, leaving: Option<Uuid>, via: &User) -> Result<(), LifecycleError> {
        let players: Vec<User> = self
            .host
            .online_users()
            .into_iter()
            .filter(|u| Some(u.uuid) != leaving)
            .collect();
        self.cache.set_own_roster(players.clone());
        self.cluster
            .broadcast_roster(
                RosterDelta {
                    node: self.node.clone(),
                    players,
                },
                via,
            )
            .await?;
        Ok(())
    }
}
