//! Teleport orchestration: local moves, cross-node dispatch, and the single
//! finalize funnel that clears in-flight descriptors.
//!
//! A teleport leaves this node in one of two ways:
//! - **directive**: the teleportee stays where they are and their node carries
//!   out the move, replying with the outcome; this node then finalizes.
//! - **hop**: the proxy moves the teleportee to the destination node, which
//!   resumes the persisted descriptor on arrival and finalizes there.

use std::sync::Arc;

use crossport_api::{
    ClusterError, ClusterMessenger, CorrelationToken, Database, Destination, Host, Notice,
    PlayerLocation, Position, StoreError, TeleportDescriptor, TeleportDirective, TeleportKind,
    TeleportOutcome, TeleportReply, User,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// How a teleport request left the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A named player could not be found anywhere.
    NotFound(String),
    /// Concluded and finalized on this node.
    Finished(TeleportOutcome),
    /// Handed to another node; the outcome is finalized later.
    Dispatched(CorrelationToken),
}

/// A descriptor on its way to `finalize`.
///
/// Tracked tickets were persisted and are only finalized while storage still
/// holds the same token.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub descriptor: TeleportDescriptor,
    pub tracked: bool,
}

impl Ticket {
    pub fn local(descriptor: TeleportDescriptor) -> Self {
        Self {
            descriptor,
            tracked: false,
        }
    }

    pub fn tracked(descriptor: TeleportDescriptor) -> Self {
        Self {
            descriptor,
            tracked: true,
        }
    }
}

/// Safety classification of a destination, first failing check wins.
///
/// Returns `None` when the move may go ahead.
pub fn classify(host: &dyn Host, position: &Position, node_reachable: bool) -> Option<TeleportOutcome> {
    if !host.world_exists(&position.world) {
        Some(TeleportOutcome::FailedInvalidWorld)
    } else if !node_reachable {
        Some(TeleportOutcome::FailedInvalidNode)
    } else if !host.within_bounds(position) {
        Some(TeleportOutcome::FailedIllegalCoordinates)
    } else if !host.is_safe(position) {
        Some(TeleportOutcome::FailedUnsafe)
    } else {
        None
    }
}

pub struct TeleportCoordinator {
    node: String,
    spawn: Position,
    cross_node: bool,
    host: Arc<dyn Host>,
    db: Arc<dyn Database>,
    cluster: Arc<dyn ClusterMessenger>,
    cache: Arc<Cache>,
}

impl TeleportCoordinator {
    pub fn new(
        spawn: Position,
        cross_node: bool,
        host: Arc<dyn Host>,
        db: Arc<dyn Database>,
        cluster: Arc<dyn ClusterMessenger>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            node: cache.node().to_string(),
            spawn,
            cross_node,
            host,
            db,
            cluster,
            cache,
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Move `teleportee` to wherever `target` currently is.
    pub async fn teleport_to_player(
        &self,
        initiator: &User,
        teleportee: &str,
        target: &str,
    ) -> Result<Dispatch, CoordinatorError> {
        let Some(who) = self.locate(teleportee).await? else {
            return Ok(self.not_found(initiator, teleportee).await);
        };
        let Some(dest) = self.locate(target).await? else {
            return Ok(self.not_found(initiator, target).await);
        };

        let descriptor = TeleportDescriptor::new(
            initiator.clone(),
            who.user.clone(),
            Destination::Player(dest.user.clone()),
            TeleportKind::Ordinary,
            self.node.clone(),
        );

        if who.node != dest.node {
            return self.hop(descriptor, &dest.node).await;
        }
        if who.node != self.node {
            return self.direct(descriptor, &who.node).await;
        }
        match self.host.position(dest.user.uuid) {
            Some(position) => self.run_local(descriptor, &position).await,
            None => Ok(self.not_found(initiator, target).await),
        }
    }

    /// Move `teleportee` to an explicit position.
    pub async fn teleport_to_position(
        &self,
        initiator: &User,
        teleportee: &str,
        position: Position,
    ) -> Result<Dispatch, CoordinatorError> {
        let Some(who) = self.locate(teleportee).await? else {
            return Ok(self.not_found(initiator, teleportee).await);
        };
        self.teleport_user(initiator, who, position, TeleportKind::Ordinary)
            .await
    }

    /// Move an already located player. Used directly by the respawn path.
    pub async fn teleport_user(
        &self,
        initiator: &User,
        who: PlayerLocation,
        position: Position,
        kind: TeleportKind,
    ) -> Result<Dispatch, CoordinatorError> {
        let destination_node = position.node.clone();
        let descriptor = TeleportDescriptor::new(
            initiator.clone(),
            who.user,
            Destination::Position(position.clone()),
            kind,
            self.node.clone(),
        );

        if destination_node != who.node {
            return self.hop(descriptor, &destination_node).await;
        }
        if who.node != self.node {
            return self.direct(descriptor, &who.node).await;
        }
        self.run_local(descriptor, &position).await
    }

    // -----------------------------------------------------------------------
    // Finalize funnel
    // -----------------------------------------------------------------------

    /// Conclude a teleport: clear its descriptor and notify the initiator.
    ///
    /// Returns `false` without doing anything when a tracked ticket's
    /// descriptor was already cleared or superseded.
    pub async fn finalize(
        &self,
        ticket: &Ticket,
        outcome: TeleportOutcome,
    ) -> Result<bool, CoordinatorError> {
        let d = &ticket.descriptor;
        if ticket.tracked
            && !self
                .db
                .clear_pending_teleport_if(d.teleportee.uuid, d.token)
                .await?
        {
            debug!("Teleport {} already cleared or superseded", d.token);
            return Ok(false);
        }

        info!(
            "Teleport {} of {} to {} finished: {outcome:?}",
            d.token, d.teleportee.username, d.destination
        );
        if d.kind == TeleportKind::Ordinary || !outcome.successful() {
            self.notify(&d.initiator, &d.origin_node, Notice::for_outcome(outcome))
                .await;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Cluster-facing handlers
    // -----------------------------------------------------------------------

    /// Carry out a directive for a player hosted here and reply to its origin.
    pub async fn handle_directive(&self, directive: TeleportDirective) -> Result<(), CoordinatorError> {
        let d = directive.descriptor;
        debug!("Directive {} for {}", d.token, d.teleportee.username);

        let outcome = match &d.destination {
            Destination::Player(target) => match self.host.position(target.uuid) {
                Some(position) => self.execute(&d.teleportee, &position, false),
                None => {
                    warn!("{} is no longer on {}", target.username, self.node);
                    None
                }
            },
            Destination::Position(position) if position.node != self.node => {
                // Destination moved off this node; the arrival node finalizes.
                match self.cluster.transfer(&d.teleportee, &position.node).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!("Transfer of {} failed: {e}", d.teleportee.username);
                        None
                    }
                }
            }
            Destination::Position(position) => self.execute(&d.teleportee, position, false),
        };

        let reply = TeleportReply {
            token: d.token,
            teleportee: d.teleportee.uuid,
            outcome: outcome.unwrap_or(TeleportOutcome::FailedInvalidNode),
        };
        self.cluster.send_reply(&d.origin_node, reply).await?;
        Ok(())
    }

    /// Finalize a directive's reply, unless its descriptor has been superseded.
    pub async fn receive_reply(&self, reply: TeleportReply) -> Result<bool, CoordinatorError> {
        match self.db.pending_teleport(reply.teleportee).await? {
            Some(stored) if stored.token == reply.token => {
                self.finalize(&Ticket::tracked(stored), reply.outcome).await
            }
            _ => {
                debug!("Discarding stale reply {}", reply.token);
                Ok(false)
            }
        }
    }

    /// Resume a descriptor left for `user`, who just arrived on this node.
    pub async fn resume(&self, user: &User) -> Result<Option<TeleportOutcome>, CoordinatorError> {
        let Some(d) = self.db.pending_teleport(user.uuid).await? else {
            return Ok(None);
        };
        match d.kind {
            TeleportKind::Respawn => self.resume_respawn(d).await.map(Some),
            TeleportKind::Ordinary => self.resume_ordinary(d).await.map(Some),
        }
    }

    /// Deliver a notice to someone hosted here (or the console).
    pub fn deliver_notice(&self, user: &User, notice: &Notice) {
        if user.is_console() {
            info!(target: "console", "{notice}");
        } else if self.host.is_online(user.uuid) {
            self.host.send_notice(user.uuid, notice);
        } else {
            debug!("Dropping notice for offline {}", user.username);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn locate(&self, username: &str) -> Result<Option<PlayerLocation>, CoordinatorError> {
        if let Some(user) = self.host.find_user(username) {
            return Ok(Some(PlayerLocation {
                user,
                node: self.node.clone(),
            }));
        }
        if !self.cross_node {
            return Ok(None);
        }
        if let Some(cached) = self.cache.locate(username) {
            // Our own roster entry is stale if the host no longer has them.
            if cached.node != self.node {
                return Ok(Some(cached));
            }
        }
        Ok(self.cluster.locate(username).await?)
    }

    async fn not_found(&self, initiator: &User, name: &str) -> Dispatch {
        self.notify(
            initiator,
            &self.node,
            Notice::PlayerNotFound {
                name: name.to_string(),
            },
        )
        .await;
        Dispatch::NotFound(name.to_string())
    }

    async fn run_local(
        &self,
        descriptor: TeleportDescriptor,
        position: &Position,
    ) -> Result<Dispatch, CoordinatorError> {
        match self.execute(&descriptor.teleportee, position, false) {
            Some(outcome) => {
                self.finalize(&Ticket::local(descriptor), outcome).await?;
                Ok(Dispatch::Finished(outcome))
            }
            None => Ok(self
                .not_found(&descriptor.initiator, &descriptor.teleportee.username)
                .await),
        }
    }

    /// Classify and perform a move on this node. `None` if the player is gone.
    fn execute(&self, user: &User, position: &Position, hopped: bool) -> Option<TeleportOutcome> {
        if let Some(failure) = classify(&*self.host, position, position.node == self.node) {
            return Some(failure);
        }
        if !self.host.teleport(user.uuid, position) {
            return None;
        }
        Some(if hopped {
            TeleportOutcome::CompletedCrossNode
        } else {
            TeleportOutcome::CompletedLocally
        })
    }

    async fn conclude(
        &self,
        descriptor: TeleportDescriptor,
        outcome: TeleportOutcome,
    ) -> Result<Dispatch, CoordinatorError> {
        self.finalize(&Ticket::local(descriptor), outcome).await?;
        Ok(Dispatch::Finished(outcome))
    }

    /// Persist a descriptor, replacing whatever was in flight for the user.
    async fn track(&self, descriptor: TeleportDescriptor) -> Result<Ticket, CoordinatorError> {
        self.db
            .set_pending_teleport(descriptor.teleportee.uuid, Some(descriptor.clone()))
            .await?;
        Ok(Ticket::tracked(descriptor))
    }

    async fn hop(
        &self,
        descriptor: TeleportDescriptor,
        node: &str,
    ) -> Result<Dispatch, CoordinatorError> {
        // Same order as `classify`: the world is judged before the node.
        if let Destination::Position(position) = &descriptor.destination {
            if !self.host.world_exists(&position.world) {
                return self.conclude(descriptor, TeleportOutcome::FailedInvalidWorld).await;
            }
        }
        if !self.cross_node || !self.cluster.is_reachable(node) {
            return self.conclude(descriptor, TeleportOutcome::FailedInvalidNode).await;
        }
        let ticket = self.track(descriptor).await?;
        let d = &ticket.descriptor;
        info!("Sending {} to {node} (teleport {})", d.teleportee.username, d.token);

        if self.host.is_online(d.teleportee.uuid) {
            self.host.send_notice(
                d.teleportee.uuid,
                &Notice::TeleportingCrossNode {
                    node: node.to_string(),
                },
            );
        }
        if let Err(e) = self.cluster.transfer(&d.teleportee, node).await {
            warn!("Transfer of {} to {node} failed: {e}", d.teleportee.username);
            self.finalize(&ticket, TeleportOutcome::FailedInvalidNode).await?;
            return Ok(Dispatch::Finished(TeleportOutcome::FailedInvalidNode));
        }
        Ok(Dispatch::Dispatched(d.token))
    }

    async fn direct(
        &self,
        descriptor: TeleportDescriptor,
        node: &str,
    ) -> Result<Dispatch, CoordinatorError> {
        if !self.cluster.is_reachable(node) {
            return self.conclude(descriptor, TeleportOutcome::FailedInvalidNode).await;
        }
        let ticket = self.track(descriptor).await?;
        let token = ticket.descriptor.token;
        debug!("Directing {node} to move {} (teleport {token})", ticket.descriptor.teleportee.username);

        let directive = TeleportDirective {
            descriptor: ticket.descriptor.clone(),
        };
        if let Err(e) = self.cluster.send_directive(node, directive).await {
            warn!("Directive to {node} failed: {e}");
            self.finalize(&ticket, TeleportOutcome::FailedInvalidNode).await?;
            return Ok(Dispatch::Finished(TeleportOutcome::FailedInvalidNode));
        }
        Ok(Dispatch::Dispatched(token))
    }

    async fn resume_ordinary(&self, d: TeleportDescriptor) -> Result<TeleportOutcome, CoordinatorError> {
        let position = match &d.destination {
            Destination::Position(position) => Some(position.clone()),
            Destination::Player(target) => self.host.position(target.uuid),
        };
        let outcome = position
            .and_then(|p| self.execute(&d.teleportee, &p, true))
            .unwrap_or(TeleportOutcome::FailedInvalidNode);

        if d.initiator.uuid != d.teleportee.uuid {
            let arrival = if outcome.successful() {
                Notice::TeleportComplete
            } else {
                Notice::InvalidOnArrival
            };
            self.host.send_notice(d.teleportee.uuid, &arrival);
        }
        self.finalize(&Ticket::tracked(d), outcome).await?;
        Ok(outcome)
    }

    async fn resume_respawn(&self, d: TeleportDescriptor) -> Result<TeleportOutcome, CoordinatorError> {
        if !matches!(d.destination, Destination::Position(_)) {
            error!(
                "Respawn teleport {} for {} has a player destination",
                d.token, d.teleportee.username
            );
            // Left in place it would fire again on every join.
            self.db
                .clear_pending_teleport_if(d.teleportee.uuid, d.token)
                .await?;
            return Err(CoordinatorError::Invariant(format!(
                "respawn teleport {} without a position",
                d.token
            )));
        }

        let user = &d.teleportee;
        let bed = self
            .host
            .bed_spawn(user.uuid)
            .filter(|bed| classify(&*self.host, bed, bed.node == self.node).is_none());
        let target = match bed {
            Some(bed) => bed,
            None => {
                // Missing or obstructed.
                self.host.send_notice(user.uuid, &Notice::SpawnNotValid);
                self.spawn.clone()
            }
        };
        if !self.host.teleport(user.uuid, &target) {
            warn!("{} left {} before respawning", user.username, self.node);
            self.finalize(&Ticket::tracked(d), TeleportOutcome::FailedInvalidNode)
                .await?;
            return Ok(TeleportOutcome::FailedInvalidNode);
        }
        self.db
            .set_respawn_position(user.uuid, Some(target))
            .await?;
        self.finalize(&Ticket::tracked(d), TeleportOutcome::CompletedCrossNode)
            .await?;
        Ok(TeleportOutcome::CompletedCrossNode)
    }

    async fn notify(&self, user: &User, origin_node: &str, notice: Notice) {
        let hosted_here = if user.is_console() {
            origin_node == self.node
        } else {
            self.host.is_online(user.uuid)
        };
        if hosted_here || !self.cross_node {
            self.deliver_notice(user, &notice);
            return;
        }
        if let Err(e) = self.cluster.relay_notice(origin_node, user, notice).await {
            debug!("Could not relay notice to {}: {e}", user.username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use crate::testkit::{args, config, TestCluster};
    use async_trait::async_trait;
    use crossport_api::TeleportOutcome::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn descriptor(user: &User, node: &str) -> TeleportDescriptor {
        TeleportDescriptor::new(
            user.clone(),
            user.clone(),
            Destination::Position(Position::new(5.0, 64.0, 5.0, "world", node)),
            TeleportKind::Ordinary,
            node,
        )
    }

    #[tokio::test]
    async fn classification_order() {
        let mut t = TestCluster::new(true, false);
        t.join("lobby", "Alice").await;
        let host = t.node("lobby").host();
        let hazard = Position::new(2000.0, 64.0, 0.0, "world", "lobby");
        host.mark_hazard(&hazard);

        // Unknown world wins over an unreachable node.
        let p = Position::new(0.0, 64.0, 0.0, "the_end", "nowhere");
        assert_eq!(classify(host, &p, false), Some(FailedInvalidWorld));
        let p = Position::new(0.0, 64.0, 0.0, "world", "nowhere");
        assert_eq!(classify(host, &p, false), Some(FailedInvalidNode));
        // Out of bounds wins over unsafe.
        assert_eq!(classify(host, &hazard, true), Some(FailedIllegalCoordinates));
        let p = Position::new(0.0, 200.0, 0.0, "nether", "lobby");
        assert_eq!(classify(host, &p, true), Some(FailedIllegalCoordinates));
        let unsafe_spot = Position::new(10.0, 64.0, 10.0, "world", "lobby");
        host.mark_hazard(&unsafe_spot);
        assert_eq!(classify(host, &unsafe_spot, true), Some(FailedUnsafe));
        let fine = Position::new(11.0, 64.0, 10.0, "world", "lobby");
        assert_eq!(classify(host, &fine, true), None);
    }

    #[tokio::test]
    async fn finalize_clears_once_for_every_outcome() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("lobby", "Alice").await;
        let coordinator = t.node("lobby").coordinator();

        for outcome in TeleportOutcome::ALL {
            let d = descriptor(&alice, "lobby");
            t.store
                .set_pending_teleport(alice.uuid, Some(d.clone()))
                .await
                .unwrap();
            let ticket = Ticket::tracked(d);
            assert!(coordinator.finalize(&ticket, outcome).await.unwrap());
            assert!(t.store.pending_teleport(alice.uuid).await.unwrap().is_none());
            assert!(!coordinator.finalize(&ticket, outcome).await.unwrap());
        }
        // One notice per finalized teleport, none for the repeats.
        let notices = t.notices("lobby", &alice);
        assert_eq!(notices.len(), TeleportOutcome::ALL.len());
        assert_eq!(notices[0], Notice::TeleportComplete);
        assert_eq!(notices[2], Notice::InvalidWorld);
    }

    #[tokio::test]
    async fn stale_finalize_leaves_newer_descriptor() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("lobby", "Alice").await;
        let coordinator = t.node("lobby").coordinator();

        let old = descriptor(&alice, "lobby");
        let new = descriptor(&alice, "lobby");
        t.store
            .set_pending_teleport(alice.uuid, Some(new.clone()))
            .await
            .unwrap();
        assert!(!coordinator
            .finalize(&Ticket::tracked(old), CompletedLocally)
            .await
            .unwrap());
        assert_eq!(
            t.store.pending_teleport(alice.uuid).await.unwrap(),
            Some(new)
        );
        assert!(t.notices("lobby", &alice).is_empty());
    }

    #[tokio::test]
    async fn respawn_success_is_silent() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("lobby", "Alice").await;
        let coordinator = t.node("lobby").coordinator();

        let mut d = descriptor(&alice, "lobby");
        d.kind = TeleportKind::Respawn;
        assert!(coordinator
            .finalize(&Ticket::local(d.clone()), CompletedCrossNode)
            .await
            .unwrap());
        assert!(t.notices("lobby", &alice).is_empty());

        coordinator
            .finalize(&Ticket::local(d), FailedUnsafe)
            .await
            .unwrap();
        assert_eq!(t.notices("lobby", &alice), vec![Notice::UnsafeDestination]);
    }

    #[tokio::test]
    async fn not_found_writes_nothing() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("lobby", "Alice").await;
        let before = t.store.write_count();

        let result = t.node("lobby").tp(Some("Alice"), &args("Zed")).await.unwrap();
        assert_eq!(result, Dispatch::NotFound("Zed".into()));
        assert_eq!(t.store.write_count(), before);
        assert_eq!(
            t.notices("lobby", &alice),
            vec![Notice::PlayerNotFound { name: "Zed".into() }]
        );
    }

    #[tokio::test]
    async fn unreachable_node_fails_without_descriptor() {
        let mut t = TestCluster::new(true, false);
        let admin = t.join("lobby", "Admin").await;

        let result = t
            .node("lobby")
            .tp(Some("Admin"), &args("1 64 1 world creative"))
            .await
            .unwrap();
        assert_eq!(result, Dispatch::Finished(FailedInvalidNode));
        assert!(t.store.pending_teleport(admin.uuid).await.unwrap().is_none());
        assert_eq!(t.notices("lobby", &admin), vec![Notice::InvalidNode]);
    }

    #[tokio::test]
    async fn stale_reply_is_discarded() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("survival", "Alice").await;
        t.join("survival", "Bob").await;

        let token = match t.node("lobby").tp(None, &args("Alice Bob")).await.unwrap() {
            Dispatch::Dispatched(token) => token,
            other => panic!("expected a directive, got {other:?}"),
        };
        assert_eq!(
            t.store.pending_teleport(alice.uuid).await.unwrap().unwrap().token,
            token
        );

        // A newer teleport supersedes the one in flight.
        let newer = descriptor(&alice, "lobby");
        t.store
            .set_pending_teleport(alice.uuid, Some(newer.clone()))
            .await
            .unwrap();
        t.settle().await;

        assert_eq!(
            t.store.pending_teleport(alice.uuid).await.unwrap(),
            Some(newer)
        );
    }

    #[tokio::test]
    async fn directive_round_trip_finalizes_on_origin() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("survival", "Alice").await;
        let bob = t.join("survival", "Bob").await;
        t.node("survival")
            .host()
            .teleport(bob.uuid, &Position::new(40.0, 70.0, -3.0, "world", "survival"));

        let result = t.node("lobby").tp(None, &args("Alice Bob")).await.unwrap();
        assert!(matches!(result, Dispatch::Dispatched(_)));
        t.settle().await;

        assert_eq!(
            t.position("survival", &alice),
            t.position("survival", &bob)
        );
        assert!(t.store.pending_teleport(alice.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directive_for_departed_target_fails() {
        let mut t = TestCluster::new(true, false);
        let alice = t.join("survival", "Alice").await;
        let bob = t.join("survival", "Bob").await;

        let descriptor = TeleportDescriptor::new(
            User::console(),
            alice.clone(),
            Destination::Player(bob.clone()),
            TeleportKind::Ordinary,
            "lobby",
        );
        t.store
            .set_pending_teleport(alice.uuid, Some(descriptor.clone()))
            .await
            .unwrap();
        t.console("survival", "leave Bob").await;

        t.node("survival")
            .coordinator()
            .handle_directive(TeleportDirective { descriptor })
            .await
            .unwrap();
        t.settle().await;
        assert!(t.store.pending_teleport(alice.uuid).await.unwrap().is_none());
        assert_eq!(
            t.position("survival", &alice),
            Some(t.node("survival").host().spawn())
        );
    }

    #[tokio::test]
    async fn unknown_world_reported_before_unreachable_node() {
        let mut t = TestCluster::new(true, false);
        let admin = t.join("lobby", "Admin").await;

        let result = t
            .node("lobby")
            .tp(Some("Admin"), &args("0 64 0 the_end creative"))
            .await
            .unwrap();
        assert_eq!(result, Dispatch::Finished(FailedInvalidWorld));
        assert_eq!(t.notices("lobby", &admin), vec![Notice::InvalidWorld]);
    }

    #[tokio::test]
    async fn back_to_back_directives_finalize_once() {
        let mut t = TestCluster::new(true, false);
        let admin = t.join("lobby", "Admin").await;
        let alice = t.join("survival", "Alice").await;
        let bob = t.join("survival", "Bob").await;
        let carol = t.join("survival", "Carol").await;
        let survival = t.node("survival").host();
        survival.teleport(bob.uuid, &Position::new(20.0, 70.0, 20.0, "world", "survival"));
        let at_carol = Position::new(-20.0, 66.0, 5.0, "world", "survival");
        survival.teleport(carol.uuid, &at_carol);

        let lobby = t.node("lobby");
        let first = lobby.tp(Some("Admin"), &args("Alice Bob")).await.unwrap();
        let second = lobby.tp(Some("Admin"), &args("Alice Carol")).await.unwrap();
        assert!(matches!(first, Dispatch::Dispatched(_)));
        assert!(matches!(second, Dispatch::Dispatched(_)));
        assert_ne!(first, second);
        t.settle().await;

        assert_eq!(t.position("survival", &alice), Some(at_carol));
        assert_eq!(t.notices("lobby", &admin), vec![Notice::TeleportComplete]);
        assert!(t.store.pending_teleport(alice.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn respawn_for_departed_player_saves_nothing() {
        let mut t = TestCluster::new(true, true);
        let alice = t.join("lobby", "Alice").await;
        t.console("lobby", "leave Alice").await;

        let mut d = descriptor(&alice, "lobby");
        d.kind = TeleportKind::Respawn;
        t.store
            .set_pending_teleport(alice.uuid, Some(d))
            .await
            .unwrap();
        let outcome = t.node("lobby").coordinator().resume(&alice).await.unwrap();
        assert_eq!(outcome, Some(FailedInvalidNode));
        assert!(t.store.respawn_position(alice.uuid).await.unwrap().is_none());
        assert!(t.store.pending_teleport(alice.uuid).await.unwrap().is_none());
    }

    /// Lets another writer replace the pending teleport right after each read.
    struct InterleavingStore {
        inner: Arc<JsonStore>,
        next: Mutex<Option<TeleportDescriptor>>,
    }

    #[async_trait]
    impl Database for InterleavingStore {
        async fn ensure_user(&self, user: &User) -> Result<(), StoreError> {
            self.inner.ensure_user(user).await
        }
        async fn ignore_flag(&self, uuid: Uuid) -> Result<Option<bool>, StoreError> {
            self.inner.ignore_flag(uuid).await
        }
        async fn set_ignore_flag(&self, uuid: Uuid, ignoring: bool) -> Result<(), StoreError> {
            self.inner.set_ignore_flag(uuid, ignoring).await
        }
        async fn home_names(&self, uuid: Uuid) -> Result<Vec<String>, StoreError> {
            self.inner.home_names(uuid).await
        }
        async fn pending_teleport(
            &self,
            uuid: Uuid,
        ) -> Result<Option<TeleportDescriptor>, StoreError> {
            let current = self.inner.pending_teleport(uuid).await?;
            let next = self.next.lock().take();
            if next.is_some() {
                self.inner.set_pending_teleport(uuid, next).await?;
            }
            Ok(current)
        }
        async fn set_pending_teleport(
            &self,
            uuid: Uuid,
            descriptor: Option<TeleportDescriptor>,
        ) -> Result<(), StoreError> {
            self.inner.set_pending_teleport(uuid, descriptor).await
        }
        async fn clear_pending_teleport_if(
            &self,
            uuid: Uuid,
            token: CorrelationToken,
        ) -> Result<bool, StoreError> {
            self.inner.clear_pending_teleport_if(uuid, token).await
        }
        async fn respawn_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
            self.inner.respawn_position(uuid).await
        }
        async fn set_respawn_position(
            &self,
            uuid: Uuid,
            position: Option<Position>,
        ) -> Result<(), StoreError> {
            self.inner.set_respawn_position(uuid, position).await
        }
        async fn offline_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
            self.inner.offline_position(uuid).await
        }
        async fn set_offline_position(
            &self,
            uuid: Uuid,
            position: Position,
        ) -> Result<(), StoreError> {
            self.inner.set_offline_position(uuid, position).await
        }
        async fn last_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
            self.inner.last_position(uuid).await
        }
        async fn set_last_position(&self, uuid: Uuid, position: Position) -> Result<(), StoreError> {
            self.inner.set_last_position(uuid, position).await
        }
    }

    #[tokio::test]
    async fn reply_racing_a_newer_teleport_leaves_it_in_place() {
        let store = Arc::new(JsonStore::in_memory());
        let db = Arc::new(InterleavingStore {
            inner: store.clone(),
            next: Mutex::new(None),
        });
        let mut t = TestCluster::build(&config(true, false), store, db.clone());
        let admin = t.join("lobby", "Admin").await;
        let alice = t.join("survival", "Alice").await;
        t.join("survival", "Bob").await;

        let result = t.node("lobby").tp(Some("Admin"), &args("Alice Bob")).await.unwrap();
        assert!(matches!(result, Dispatch::Dispatched(_)));
        let newer = descriptor(&alice, "lobby");
        *db.next.lock() = Some(newer.clone());
        t.settle().await;

        assert_eq!(
            t.store.pending_teleport(alice.uuid).await.unwrap(),
            Some(newer)
        );
        assert!(t.notices("lobby", &admin).is_empty());
    }
}
