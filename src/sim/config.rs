use std::path::PathBuf;

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub log_level: u64,
    pub timeout: u64,
    /// CSV file receiving one line per grant.
    pub trace: Option<PathBuf>,
    /// JSON file receiving the final statistics.
    pub stats_json: Option<PathBuf>,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .context("cannot deserialize config section"),
            None => {
                warn!("config section not found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            timeout: 1_000_000,
            trace: None,
            stats_json: None,
        }
    }
}
