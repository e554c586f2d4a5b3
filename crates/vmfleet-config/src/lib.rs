// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration file for the vmfleet server.
//!
//! ```toml
//! state_file = "vms.json"
//! ui_folder = "ui"
//!
//! [transitions]
//! start_delay_ms = 10000
//! stop_delay_ms = 5000
//! ```
//!
//! Every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_STATE_FILE: &str = "vms.json";
pub const DEFAULT_START_DELAY_MS: u64 = 10_000;
pub const DEFAULT_STOP_DELAY_MS: u64 = 5_000;

/// Configuration for the vmfleet server.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// JSON file the fleet is loaded from (and generated into, if missing).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Directory of static files served under `/ui/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_folder: Option<PathBuf>,

    #[serde(default)]
    pub transitions: Transitions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_file: default_state_file(),
            ui_folder: None,
            transitions: Transitions::default(),
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

/// Simulated durations of the deferred half of each lifecycle transition.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Transitions {
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,

    #[serde(default = "default_stop_delay_ms")]
    pub stop_delay_ms: u64,
}

impl Transitions {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn stop_delay(&self) -> Duration {
        Duration::from_millis(self.stop_delay_ms)
    }
}

impl Default for Transitions {
    fn default() -> Self {
        Transitions {
            start_delay_ms: DEFAULT_START_DELAY_MS,
            stop_delay_ms: DEFAULT_STOP_DELAY_MS,
        }
    }
}

fn default_start_delay_ms() -> u64 {
    DEFAULT_START_DELAY_MS
}

fn default_stop_delay_ms() -> u64 {
    DEFAULT_STOP_DELAY_MS
}

/// Errors which may be returned when parsing the server configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
