//! Master configuration: desired fleet shape and restart directives.
//!
//! The file format is TOML; the path comes from `FLEET_CONFIG`. The
//! master only depends on the minimal contract: a desired count per
//! machine type, a restart-all flag, and an ordered list of machine names
//! to force-restart individually. Anything unparseable is a configuration
//! error and aborts before infrastructure is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use fleet_id::{MachineId, MachineType};
use serde::Deserialize;
use thiserror::Error;

use crate::policy::DependencyPolicy;
use crate::vagrant::VagrantConfig;

/// Errors that can occur loading the master configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `FLEET_CONFIG` is not set.
    #[error("FLEET_CONFIG is not set")]
    MissingEnv,

    /// The config file cannot be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file does not parse.
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Desired machine count per type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetShape {
    pub storage: u32,
    pub worker: u32,
    pub coordinator: u32,
    pub frontend: u32,
    pub mongo: u32,
    pub gateway: u32,
}

impl FleetShape {
    /// The desired count for one machine type.
    pub fn count(&self, ty: MachineType) -> u32 {
        match ty {
            MachineType::Storage => self.storage,
            MachineType::Worker => self.worker,
            MachineType::Coordinator => self.coordinator,
            MachineType::Frontend => self.frontend,
            MachineType::Mongo => self.mongo,
            MachineType::Gateway => self.gateway,
        }
    }

    /// Every machine id the shape calls for, in id order. Indices are
    /// assigned densely from zero within each type.
    pub fn desired_machines(&self) -> Vec<MachineId> {
        let mut machines = Vec::new();
        for ty in MachineType::ALL {
            for index in 0..self.count(ty) {
                machines.push(MachineId::new(ty, index));
            }
        }
        machines
    }
}

/// Restart directives for a pass.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestartDirectives {
    /// Force-restart the agent on every desired machine.
    pub all: bool,

    /// Machine names to force-restart individually, in order. Parsed per
    /// the canonical `<type><index>` form; a malformed name aborts the
    /// pass before any driver call.
    pub machines: Vec<String>,
}

/// Master configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub fleet: FleetShape,
    pub restart: RestartDirectives,

    /// Startup dependency override. Absent types depend on nothing;
    /// an absent table means the built-in policy.
    pub dependencies: Option<BTreeMap<MachineType, BTreeSet<MachineType>>>,

    pub vagrant: VagrantConfig,
}

impl MasterConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads the config file named by `FLEET_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("FLEET_CONFIG").map_err(|_| ConfigError::MissingEnv)?;
        Self::load(path)
    }

    /// The startup dependency policy for this deployment.
    pub fn policy(&self) -> DependencyPolicy {
        match &self.dependencies {
            Some(table) => DependencyPolicy::new(table.clone()),
            None => DependencyPolicy::default(),
        }
    }
}
