use serde::Deserialize;
use std::path::Path;

use crossport_api::{permission, Position};

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub teleport: TeleportSection,
    #[serde(default = "default_worlds")]
    pub worlds: Vec<WorldSection>,
    #[serde(default)]
    pub permissions: PermissionsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct NodeSection {
    pub name: String,
    /// Directory for the JSON user store. Absent = memory only.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub spawn: SpawnSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnSection {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for SpawnSection {
    fn default() -> Self {
        Self {
            world: "world".into(),
            x: 0.0,
            y: 64.0,
            z: 0.0,
        }
    }
}

impl SpawnSection {
    pub fn position(&self, node: &str) -> Position {
        Position::new(self.x, self.y, self.z, self.world.clone(), node)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterSection {
    /// Cross-node mode. Off = every teleport stays on this node.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub global_respawning: bool,
    /// Members started in-process by the binary.
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TeleportSection {
    #[serde(default = "default_true")]
    pub return_by_death: bool,
    /// Upper bound on the respawn-point lookup inside the respawn callback.
    #[serde(default = "default_respawn_lookup_timeout_ms")]
    pub respawn_lookup_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_respawn_lookup_timeout_ms() -> u64 {
    250
}

impl Default for TeleportSection {
    fn default() -> Self {
        Self {
            return_by_death: true,
            respawn_lookup_timeout_ms: default_respawn_lookup_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorldSection {
    pub name: String,
    #[serde(default = "default_border_radius")]
    pub border_radius: f64,
    #[serde(default = "default_min_y")]
    pub min_y: f64,
    #[serde(default = "default_max_y")]
    pub max_y: f64,
}

fn default_border_radius() -> f64 {
    29_999_984.0
}

fn default_min_y() -> f64 {
    -64.0
}

fn default_max_y() -> f64 {
    320.0
}

fn default_worlds() -> Vec<WorldSection> {
    vec![WorldSection {
        name: "world".into(),
        border_radius: default_border_radius(),
        min_y: default_min_y(),
        max_y: default_max_y(),
    }]
}

#[derive(Debug, Deserialize)]
pub struct PermissionsSection {
    /// Players granted every permission.
    #[serde(default)]
    pub operators: Vec<String>,
    /// Permissions every player starts with.
    #[serde(default = "default_permissions")]
    pub defaults: Vec<String>,
}

fn default_permissions() -> Vec<String> {
    vec![
        permission::TP.to_string(),
        permission::BACK_RETURN_BY_DEATH.to_string(),
    ]
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            operators: Vec::new(),
            defaults: default_permissions(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Nodes this process runs. Always includes `[node] name`.
    pub fn member_nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.node.name.clone()];
        if self.cluster.enabled {
            for name in &self.cluster.nodes {
                if !nodes.contains(name) {
                    nodes.push(name.clone());
                }
            }
        }
        nodes
    }
}
