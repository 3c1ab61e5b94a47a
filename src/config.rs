use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::layer::{Layer, StaticCatalog};
use crate::Error;

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_max_connections() -> u32 {
    10
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("media")
}

/// Server configuration, read from YAML.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Selects the `<tenant>_gis` schema layer tables are read from.
    #[serde(default)]
    pub tenant: Option<String>,
    /// Layer archive paths are relative to this directory.
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Config {
    /// Constructs a configuration from a YAML document.
    pub fn from(data: &str) -> Result<Config, Error> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let data = fs::read_to_string(path)?;
        Config::from(&data)
    }

    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::new(self.layers.iter().cloned())
    }
}
