use litemsg::{Identity, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub identity: Identity,
    pub host: String,
    pub port: u16,
    /// Storage root of the node. Uploads land somewhere below it.
    #[serde(default)]
    pub base_dir: PathBuf,
}

impl NodeConfig {
    #[inline]
    pub fn service_url(&self) -> Node {
        Node::new(&self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Program started for each worker, with `<host> <port>` as positional arguments.
    /// A bare name is looked up next to the running executable first.
    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,
    /// Workers listen on consecutive ports starting here.
    pub base_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Each worker stores its sessions under `<base_dir>/worker_<port>`.
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub compiler: String,
    /// Passed before the per-request compiler options.
    #[serde(default)]
    pub compiler_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extensions of files counted as build artifacts besides executables.
    #[serde(default)]
    pub artifact_extensions: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            compiler: "rustc".to_owned(),
            compiler_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            artifact_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    /// Wall-clock bound of one test artifact run
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_worker_program() -> PathBuf {
    PathBuf::from("worker")
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FedConfig {
    #[serde(rename = "node")]
    pub nodes: Vec<NodeConfig>,

    pub pool: PoolConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub test: TestConfig,
}

impl FedConfig {
    pub fn address_book(&self) -> AddressBook {
        AddressBook {
            nodes: self
                .nodes
                .iter()
                .map(|n| (n.identity, n.clone()))
                .collect(),
        }
    }

    /// The configuration of a pool worker listening at `host:port`.
    pub fn worker_node(&self, host: &str, port: u16) -> NodeConfig {
        NodeConfig {
            identity: Identity::Worker,
            host: host.to_owned(),
            port,
            base_dir: self.pool.base_dir.join(format!("worker_{}", port)),
        }
    }
}

/// Where every fixed-identity node of the federation can be reached.
/// Built once per node and owned by it.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    nodes: HashMap<Identity, NodeConfig>,
}

impl AddressBook {
    pub fn get(&self, identity: Identity) -> anyhow::Result<&NodeConfig> {
        self.nodes
            .get(&identity)
            .ok_or_else(|| anyhow::anyhow!("no address configured for {}", identity))
    }

    pub fn address(&self, identity: Identity) -> anyhow::Result<Node> {
        self.get(identity).map(NodeConfig::service_url)
    }
}

pub fn read_config<P: AsRef<Path>>(path: P) -> anyhow::Result<FedConfig> {
    let content = std::fs::read_to_string(&path).map_err(|e| {
        anyhow::anyhow!("fail to read config {}: {}", path.as_ref().display(), e)
    })?;
    let config: FedConfig = toml::from_str(&content)?;

    let mut seen = std::collections::HashSet::new();
    for n in &config.nodes {
        if n.identity == Identity::Worker {
            anyhow::bail!("workers are configured through [pool], not [[node]]");
        }
        if !seen.insert(n.identity) {
            anyhow::bail!("duplicated node entry for {}", n.identity);
        }
    }

    Ok(config)
}

/// Resolves a program name, preferring a binary that sits next to the running executable.
pub fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() == 1 {
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let sibling = dir.join(program);
            if sibling.exists() {
                return sibling;
            }
        }
    }
    program.to_path_buf()
}
