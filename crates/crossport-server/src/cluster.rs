//! In-process cluster: a message hub between nodes plus the proxy's registry
//! of which node each player is connected to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crossport_api::{
    ClusterError, ClusterMessage, ClusterMessenger, Notice, PlayerLocation, RosterDelta,
    TeleportDirective, TeleportReply, User,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Per-node inbox capacity.
pub const INBOX_CAPACITY: usize = 256;

#[derive(Default)]
pub struct LocalCluster {
    routes: RwLock<HashMap<String, mpsc::Sender<ClusterMessage>>>,
    /// Lowercase username → where the proxy has that player connected.
    registry: RwLock<HashMap<String, PlayerLocation>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and hand back its inbox.
    pub fn join_node(&self, node: &str) -> mpsc::Receiver<ClusterMessage> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.routes.write().insert(node.to_string(), tx);
        info!("Node {node} joined the cluster");
        rx
    }

    pub fn leave_node(&self, node: &str) {
        self.routes.write().remove(node);
        self.registry.write().retain(|_, loc| loc.node != node);
        info!("Node {node} left the cluster");
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.routes.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// A player connects through the proxy. Any previous connection is closed.
    pub async fn connect(&self, user: &User, node: &str) -> Result<(), ClusterError> {
        if !self.is_reachable(node) {
            return Err(ClusterError::Unreachable(node.to_string()));
        }
        let previous = self.registry.write().insert(
            user.username.to_lowercase(),
            PlayerLocation {
                user: user.clone(),
                node: node.to_string(),
            },
        );
        if let Some(previous) = previous {
            self.deliver(&previous.node, ClusterMessage::Disconnect { user: user.clone() })
                .await?;
        }
        self.deliver(node, ClusterMessage::Connect { user: user.clone() })
            .await
    }

    /// A player closes their connection entirely.
    pub async fn disconnect(&self, user: &User) -> Result<(), ClusterError> {
        let previous = self.registry.write().remove(&user.username.to_lowercase());
        match previous {
            Some(previous) => {
                self.deliver(&previous.node, ClusterMessage::Disconnect { user: user.clone() })
                    .await
            }
            None => Err(ClusterError::NotConnected(user.username.clone())),
        }
    }

    async fn deliver(&self, node: &str, message: ClusterMessage) -> Result<(), ClusterError> {
        let tx = self
            .routes
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| ClusterError::Unreachable(node.to_string()))?;
        trace!("-> {node}: {message:?}");
        tx.send(message)
            .await
            .map_err(|_| ClusterError::ChannelClosed(node.to_string()))
    }
}

#[async_trait]
impl ClusterMessenger for LocalCluster {
    async fn broadcast_roster(&self, delta: RosterDelta, via: &User) -> Result<(), ClusterError> {
        // Plugin messages ride a live player connection on the sending node.
        let carried = self
            .registry
            .read()
            .get(&via.username.to_lowercase())
            .is_some_and(|loc| loc.node == delta.node);
        if !carried {
            return Err(ClusterError::NotConnected(via.username.clone()));
        }
        let targets: Vec<(String, mpsc::Sender<ClusterMessage>)> = self
            .routes
            .read()
            .iter()
            .filter(|(node, _)| **node != delta.node)
            .map(|(node, tx)| (node.clone(), tx.clone()))
            .collect();
        for (node, tx) in targets {
            // At most once: a full or closed inbox just misses this snapshot.
            if tx.try_send(ClusterMessage::Roster(delta.clone())).is_err() {
                debug!("Dropped roster delta for {node}");
            }
        }
        Ok(())
    }

    async fn send_directive(
        &self,
        node: &str,
        directive: TeleportDirective,
    ) -> Result<(), ClusterError> {
        self.deliver(node, ClusterMessage::Directive(directive)).await
    }

    async fn send_reply(&self, node: &str, reply: TeleportReply) -> Result<(), ClusterError> {
        self.deliver(node, ClusterMessage::Reply(reply)).await
    }

    async fn relay_notice(
        &self,
        node: &str,
        user: &User,
        notice: Notice,
    ) -> Result<(), ClusterError> {
        // Players are reached wherever they are now; the console stays on `node`.
        let node = if user.is_console() {
            node.to_string()
        } else {
            match self.registry.read().get(&user.username.to_lowercase()) {
                Some(loc) => loc.node.clone(),
                None => return Err(ClusterError::NotConnected(user.username.clone())),
            }
        };
        self.deliver(
            &node,
            ClusterMessage::Notice {
                user: user.clone(),
                notice,
            },
        )
        .await
    }

    async fn locate(&self, username: &str) -> Result<Option<PlayerLocation>, ClusterError> {
        Ok(self.registry.read().get(&username.to_lowercase()).cloned())
    }

    fn is_reachable(&self, node: &str) -> bool {
        self.routes.read().contains_key(node)
    }

    async fn transfer(&self, user: &User, node: &str) -> Result<(), ClusterError> {
        if self.registry.read().get(&user.username.to_lowercase()).is_none() {
            return Err(ClusterError::NotConnected(user.username.clone()));
        }
        self.connect(user, node).await
    }
}
