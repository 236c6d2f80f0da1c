//! Server configuration, loaded from a YAML file.
//!
//! The original configuration surface is a key-value file searched for under the
//! `OPENFAM_ROOT` environment variable. We keep the same keys and defaults but load
//! them with `serde`/`serde_yaml` instead of hand-rolled parsing.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FamResult;

/// Whether the backing pool is kept across a process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Volatile,
    Persistent,
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::Volatile
    }
}

/// Which of the two interchangeable RPC backends a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcFrameworkType {
    Grpc,
    Thallium,
}

impl Default for RpcFrameworkType {
    fn default() -> Self {
        RpcFrameworkType::Grpc
    }
}

/// Per-memserver configuration block, keyed by memserver id in the YAML file
/// (`Memservers:<id>:...`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemserverConfig {
    /// Backing directory for the pool when `memory_type` is `persistent`.
    #[serde(default)]
    pub fam_path: Option<String>,
    /// Listening port for RDMA (libfabric).
    #[serde(default = "default_libfabric_port")]
    pub libfabric_port: u16,
    /// `interface:port` of the RPC listener.
    #[serde(default = "default_rpc_interface")]
    pub rpc_interface: String,
    /// `volatile` or `persistent`.
    #[serde(default)]
    pub memory_type: MemoryType,
    /// NIC device name to bind the fabric to.
    #[serde(default)]
    pub if_device: Option<String>,
}

fn default_libfabric_port() -> u16 {
    7500
}

fn default_rpc_interface() -> String {
    "0.0.0.0:8787".to_string()
}

/// Top-level server configuration. Mirrors the keys in the upstream configuration
/// table one for one; every field has a default so a mostly-empty YAML file is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Fabric provider name, e.g. `sockets`, `verbs`.
    pub provider: String,
    /// Per-memserver blocks, keyed by memserver id.
    #[serde(rename = "Memservers")]
    pub memservers: HashMap<u32, MemserverConfig>,
    /// ATL worker thread count. Zero disables ATL.
    #[serde(rename = "ATL_threads")]
    pub atl_threads: usize,
    /// Messages per ATL shard.
    #[serde(rename = "ATL_queue_size")]
    pub atl_queue_size: usize,
    /// Bytes of FAM reserved per ATL shard for inline/staged payloads.
    #[serde(rename = "ATL_data_size")]
    pub atl_data_size: usize,
    /// Worker threads for epoch-delayed free.
    pub delayed_free_threads: usize,
    /// Directory for backup files.
    pub fam_backup_path: String,
    /// Whether resource open/close drives refcounted registration release.
    pub resource_release: bool,
    /// `grpc` or `thallium`.
    pub rpc_framework_type: RpcFrameworkType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            provider: "sockets".to_string(),
            memservers: HashMap::new(),
            atl_threads: 0,
            atl_queue_size: 1000,
            atl_data_size: 16 * 1024 * 1024,
            delayed_free_threads: 1,
            fam_backup_path: "/tmp/fam_backup".to_string(),
            resource_release: true,
            rpc_framework_type: RpcFrameworkType::Grpc,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> FamResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::error::FamError::resource(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(contents: &str) -> FamResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| crate::error::FamError::resource(format!("invalid config: {e}")))
    }

    /// Resolve the configuration search path from the `OPENFAM_ROOT` environment
    /// variable, falling back to the current directory.
    pub fn search_path() -> std::path::PathBuf {
        std::env::var_os("OPENFAM_ROOT")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    pub fn memserver(&self, id: u32) -> Option<&MemserverConfig> {
        self.memservers.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.atl_threads, 0);
        assert!(cfg.resource_release);
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
provider: verbs
ATL_threads: 4
ATL_queue_size: 500
delayed_free_threads: 2
fam_backup_path: /mnt/backup
resource_release: false
rpc_framework_type: thallium
Memservers:
  0:
    rpc_interface: "10.0.0.1:9000"
    memory_type: persistent
    fam_path: /mnt/fam0
"#;
        let cfg = ServerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.provider, "verbs");
        assert_eq!(cfg.atl_threads, 4);
        assert!(!cfg.resource_release);
        assert_eq!(cfg.rpc_framework_type, RpcFrameworkType::Thallium);
        let ms0 = cfg.memserver(0).unwrap();
        assert_eq!(ms0.rpc_interface, "10.0.0.1:9000");
        assert_eq!(ms0.memory_type, MemoryType::Persistent);
    }
}
