mod cache;
mod cluster;
mod config;
mod coordinator;
mod lifecycle;
mod node;
mod sim;
mod store;
#[cfg(test)]
mod testkit;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cluster::LocalCluster;
use config::ServerConfig;
use crossport_api::Database;
use node::Node;
use store::JsonStore;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::load("server.toml") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load server.toml: {e}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Crossport v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Cross-node mode: {}, global respawning: {}, return by death: {}",
        config.cluster.enabled, config.cluster.global_respawning, config.teleport.return_by_death
    );

    let store = Arc::new(match &config.node.data_dir {
        Some(dir) => match JsonStore::open(Path::new(dir)) {
            Ok(store) => store,
            Err(e) => {
                eprintln!("Failed to open user store in {dir}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("No data_dir configured, user records are kept in memory only");
            JsonStore::in_memory()
        }
    });
    let db: Arc<dyn Database> = store.clone();

    let cluster = LocalCluster::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // One node task per member, each with its own console queue.
    let mut consoles: HashMap<String, mpsc::Sender<String>> = HashMap::new();
    let mut tasks = Vec::new();
    for name in config.member_nodes() {
        let (node, inbox) = Node::start(&name, &config, db.clone(), cluster.clone());
        let (console_tx, console_rx) = mpsc::channel::<String>(32);
        consoles.insert(node.name().to_string(), console_tx);
        tasks.push(tokio::spawn(node.run(inbox, console_rx, shutdown_rx.clone())));
    }
    info!("Nodes: {}", cluster.nodes().join(", "));

    // Handle Ctrl+C
    let shutdown_tx_ctrlc = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx_ctrlc.send(true);
    });

    // Console REPL: `@<node> <command>`, or just `<command>` for the home node.
    let home = config.node.name.clone();
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "stop" {
                let _ = shutdown_tx.send(true);
                break;
            }
            let (node, command) = match line.strip_prefix('@') {
                Some(rest) => match rest.split_once(char::is_whitespace) {
                    Some((node, command)) => (node.to_string(), command.trim().to_string()),
                    None => (rest.to_string(), "help".to_string()),
                },
                None => (home.clone(), line.to_string()),
            };
            match consoles.get(&node) {
                Some(tx) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                None => warn!("Unknown node {node}"),
            }
        }
    });

    for task in tasks {
        let _ = task.await;
    }
    info!("User store applied {} writes", store.write_count());
    info!("Crossport shut down.");
}
