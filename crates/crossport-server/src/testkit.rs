//! In-process cluster fixture for scenario tests.

use std::sync::Arc;

use crossport_api::{ClusterMessage, Database, Notice, Position, User};
use tokio::sync::mpsc;

use crate::cluster::LocalCluster;
use crate::config::ServerConfig;
use crate::node::{offline_uuid, Node};
use crate::store::JsonStore;

pub fn config(cross_node: bool, global_respawning: bool) -> ServerConfig {
    toml::from_str(&format!(
        r#"
        [node]
        name = "lobby"
        spawn = {{ world = "world", x = 0.5, y = 64.0, z = 0.5 }}

        [cluster]
        enabled = {cross_node}
        global_respawning = {global_respawning}
        nodes = ["lobby", "survival"]

        [[worlds]]
        name = "world"
        border_radius = 1000.0

        [[worlds]]
        name = "nether"
        min_y = 0.0
        max_y = 128.0

        [permissions]
        operators = ["Admin"]

        [logging]
        level = "debug"
        "#
    ))
    .unwrap()
}

pub struct TestCluster {
    pub cluster: Arc<LocalCluster>,
    pub store: Arc<JsonStore>,
    nodes: Vec<(Arc<Node>, mpsc::Receiver<ClusterMessage>)>,
}

impl TestCluster {
    pub fn new(cross_node: bool, global_respawning: bool) -> Self {
        let store = Arc::new(JsonStore::in_memory());
        Self::build(&config(cross_node, global_respawning), store.clone(), store)
    }

    /// `db` is what the nodes talk to; `store` is the record behind it.
    pub fn build(config: &ServerConfig, store: Arc<JsonStore>, db: Arc<dyn Database>) -> Self {
        let cluster = LocalCluster::new();
        let nodes = config
            .member_nodes()
            .iter()
            .map(|name| Node::start(name, config, db.clone(), cluster.clone()))
            .collect();
        Self {
            cluster,
            store,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> &Arc<Node> {
        &self
            .nodes
            .iter()
            .find(|(node, _)| node.name() == name)
            .unwrap()
            .0
    }

    /// Deliver queued cluster messages until every inbox is empty.
    pub async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for (node, inbox) in &mut self.nodes {
                while let Ok(message) = inbox.try_recv() {
                    node.handle_message(message).await;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    pub async fn console(&mut self, node: &str, line: &str) -> String {
        let response = self.node(node).handle_console(line).await;
        self.settle().await;
        response
    }

    pub async fn join(&mut self, node: &str, name: &str) -> User {
        self.console(node, &format!("join {name}")).await;
        User::new(offline_uuid(name), name)
    }

    pub fn position(&self, node: &str, user: &User) -> Option<Position> {
        crossport_api::Host::position(self.node(node).host(), user.uuid)
    }

    pub fn notices(&self, node: &str, user: &User) -> Vec<Notice> {
        self.node(node).host().notices_for(user.uuid)
    }
}

pub fn args(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}
