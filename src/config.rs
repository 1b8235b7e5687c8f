//! Driver fleet file.
//!
//! The fleet file lists every node the driver may talk to, with the group it
//! belongs to and the secret its agent was provisioned with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{Node, NodeRegistry};
use crate::error::{HavocError, Result};

/// Default per-node HTTP timeout for dispatch.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl FleetConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| HavocError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".config").join("havoc"))
    }

    /// Fleet file location; `HAVOC_FLEET` overrides the default.
    pub fn fleet_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("HAVOC_FLEET") {
            return Ok(PathBuf::from(shellexpand::tilde(&path).into_owned()));
        }
        Ok(Self::config_dir()?.join("fleet.yaml"))
    }

    /// Load the fleet file, or an empty fleet if it does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::fleet_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Fleet file {} not found, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = serde_yaml::from_str(&content)
            .map_err(|e| HavocError::Config(format!("Invalid fleet file {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::fleet_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;

        // Secrets live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Reject entries the registry could not address.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(HavocError::Config("Node with empty name".to_string()));
            }
            if node.endpoint.trim().is_empty() {
                return Err(HavocError::Config(format!(
                    "Node '{}' has no endpoint",
                    node.name
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Record a node. Entries with the same name get the new endpoint and
    /// secret; a new group is appended as another entry.
    pub fn add_node(&mut self, node: Node) {
        let mut same_group = false;
        for existing in self.nodes.iter_mut().filter(|n| n.name == node.name) {
            existing.endpoint = node.endpoint.clone();
            existing.secret = node.secret.clone();
            same_group |= existing.group == node.group;
        }
        if !same_group {
            self.nodes.push(node);
        }
    }

    /// Build a registry by replaying every entry through `add_node`.
    pub fn to_registry(&self) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for node in &self.nodes {
            registry.add_node(&node.name, &node.endpoint, &node.group, &node.secret);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, group: &str) -> Node {
        Node {
            name: name.to_string(),
            endpoint: format!("{}.local:6969", name),
            group: group.to_string(),
            secret: format!("{}-secret", name),
        }
    }

    #[test]
    fn test_fleet_deserialization() {
        let yaml = r#"
timeout_secs: 15
nodes:
  - name: web1
    endpoint: 10.0.0.5:6969
    group: web
    secret: s3cret
  - name: db1
    endpoint: 10.0.0.9:6969
    group: db
    secret: other
"#;
        let config: FleetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].name, "web1");
        assert_eq!(config.nodes[1].group, "db");
        assert_eq!(config.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(
            FleetConfig::default().timeout(),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("fleet.yaml");

        let mut config = FleetConfig::default();
        config.add_node(node("a", "g"));
        config.add_node(node("b", "g"));
        config.save_to(&path).unwrap();

        let loaded = FleetConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let loaded = FleetConfig::load_from(&temp_dir.path().join("missing.yaml")).unwrap();
        assert!(loaded.nodes.is_empty());
    }

    #[test]
    fn test_load_rejects_node_without_endpoint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            "nodes:\n  - name: a\n    endpoint: ''\n    group: g\n    secret: s\n",
        )
        .unwrap();

        let err = FleetConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("has no endpoint"));
    }

    #[test]
    fn test_add_node_updates_in_place() {
        let mut config = FleetConfig::default();
        config.add_node(node("a", "g"));

        let mut moved = node("a", "g");
        moved.endpoint = "10.1.1.1:6969".to_string();
        config.add_node(moved);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].endpoint, "10.1.1.1:6969");

        config.add_node(node("a", "h"));
        assert_eq!(config.nodes.len(), 2);
        assert!(config.nodes.iter().all(|n| n.endpoint == "a.local:6969"));
    }

    #[test]
    fn test_to_registry_resolves_groups() {
        let mut config = FleetConfig::default();
        config.add_node(node("a", "g"));
        config.add_node(node("b", "g"));
        config.add_node(node("c", "h"));

        let registry = config.to_registry();
        let names: Vec<String> = registry
            .resolve(&[], &["g".to_string()])
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
