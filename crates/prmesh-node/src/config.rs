use anyhow::{bail, Context, Result};
use prmesh_routing::{ProtocolConfig, RoutePolicy, DEFAULT_TRIALS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub routing: RoutingConfig,
    pub topology: TopologyConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub update_interval_secs: f64,
    pub cost_parameter: f64,
    #[serde(default = "default_trials")]
    pub trials: u32,
    #[serde(default)]
    pub route_policy: RoutePolicy,
    /// Recompute immediately on interface-down instead of waiting for the next tick
    #[serde(default)]
    pub trigger_on_interface_down: bool,
    /// Deployment-wide RNG seed; unset draws fresh entropy per node
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_trials() -> u32 {
    DEFAULT_TRIALS
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 10.0,
            cost_parameter: 1.0,
            trials: DEFAULT_TRIALS,
            route_policy: RoutePolicy::LastWriteWins,
            trigger_on_interface_down: false,
            seed: Some(1),
        }
    }
}

impl RoutingConfig {
    /// Convert to the protocol's configuration, validating it
    pub fn protocol_config(&self) -> Result<ProtocolConfig> {
        let update_interval = Duration::try_from_secs_f64(self.update_interval_secs)
            .with_context(|| format!("invalid update interval: {}s", self.update_interval_secs))?;

        let config = ProtocolConfig {
            update_interval,
            cost_parameter: self.cost_parameter,
            trials: self.trials,
            route_policy: self.route_policy,
            trigger_on_interface_down: self.trigger_on_interface_down,
            seed: self.seed,
        };
        config.validate().context("invalid routing configuration")?;

        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Number of nodes, indexed from 0
    pub nodes: u32,
    /// Point-to-point links
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Shared segments
    #[serde(default)]
    pub lans: Vec<LanConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        // Two nodes over one /30 link
        Self {
            nodes: 2,
            links: vec![LinkConfig {
                a: 0,
                b: 1,
                subnet: Some(Ipv4Addr::new(10, 1, 1, 0)),
            }],
            lans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: u32,
    pub b: u32,
    /// Base of the /30; defaults to 10.1.<link index + 1>.0
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanConfig {
    pub name: String,
    pub subnet: Ipv4Addr,
    pub nodes: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Discrete-event virtual clock; runs as fast as possible
    #[default]
    Virtual,
    /// Wall-clock timers on the tokio runtime
    Realtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub mode: SimulationMode,
    pub duration_secs: f64,
    /// Periodic routing table dumps; unset disables them
    #[serde(default)]
    pub print_interval_secs: Option<f64>,
    #[serde(default)]
    pub link_events: Vec<LinkEvent>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: SimulationMode::Virtual,
            duration_secs: 20.0,
            print_interval_secs: Some(10.0),
            link_events: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn duration(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.duration_secs)
            .with_context(|| format!("invalid simulation duration: {}s", self.duration_secs))
    }

    pub fn print_interval(&self) -> Result<Option<Duration>> {
        match self.print_interval_secs {
            None => Ok(None),
            Some(secs) => {
                let interval = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid print interval: {}s", secs))?;
                if interval.is_zero() {
                    bail!("print interval must be greater than zero");
                }
                Ok(Some(interval))
            }
        }
    }
}

/// Interface liveness change applied during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEvent {
    pub at_secs: f64,
    pub node: u32,
    /// Index among the node's non-loopback interfaces, in creation order
    #[serde(default)]
    pub interface: usize,
    pub up: bool,
}

impl LinkEvent {
    pub fn at(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.at_secs)
            .with_context(|| format!("invalid link event time: {}s", self.at_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            topology: TopologyConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: Self::default_config_path(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.config_file_path = config_path;
        config.validate()?;

        Ok(config)
    }

    /// Write the default configuration and return it
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config = Config {
            config_file_path: config_path.clone(),
            ..Config::default()
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.routing.protocol_config()?;
        self.simulation.duration()?;
        self.simulation.print_interval()?;

        let nodes = self.topology.nodes;
        if nodes == 0 {
            bail!("topology must contain at least one node");
        }
        for (i, link) in self.topology.links.iter().enumerate() {
            if link.a >= nodes || link.b >= nodes {
                bail!("link {} references a node outside 0..{}", i, nodes);
            }
            if link.a == link.b {
                bail!("link {} connects node {} to itself", i, link.a);
            }
        }
        for lan in &self.topology.lans {
            if let Some(node) = lan.nodes.iter().find(|&&n| n >= nodes) {
                bail!("lan {} references node {} outside 0..{}", lan.name, node, nodes);
            }
        }
        for event in &self.simulation.link_events {
            event.at()?;
            if event.node >= nodes {
                bail!("link event references node {} outside 0..{}", event.node, nodes);
            }
        }

        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prnode")
            .join("config.yaml")
    }
}
