//! Node configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tessera_compiler::CompilerConfig;
use tessera_core::AgentType;
use tessera_executor::ExecutorConfig;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "TESSERA_CONFIG";

/// Environment variable overriding the listen address.
pub const ADDR_ENV: &str = "TESSERA_ADDR";

/// Everything the node needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the API server binds to.
    pub addr: SocketAddr,

    pub compiler: CompilerConfig,

    pub executor: ExecutorConfig,

    /// Endpoint per agent type. Agent types without one are not served.
    pub agents: BTreeMap<AgentType, String>,

    /// Capacity of the workflow event bus.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            compiler: CompilerConfig::default(),
            executor: ExecutorConfig::default(),
            agents: BTreeMap::new(),
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Load from the file named by `TESSERA_CONFIG` (if set), then apply
    /// `TESSERA_ADDR`.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var(ADDR_ENV) {
            config.addr = addr
                .parse()
                .with_context(|| format!("invalid {} value {:?}", ADDR_ENV, addr))?;
        }

        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.executor.validate()?;
        anyhow::ensure!(self.event_capacity > 0, "event_capacity must be at least 1");
        Ok(())
    }
}
