// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading and saving the fleet as a JSON object keyed by VM ID.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use slog::{info, Logger};
use vmfleet::{default_fleet, Vm, VmId};

/// Loads the fleet stored at `path`.
///
/// If there is no file at `path`, the default fleet is written there first so
/// that it can be edited before the next run.
pub fn load_or_init(
    path: &Path,
    log: &Logger,
) -> anyhow::Result<BTreeMap<VmId, Vm>> {
    info!(log, "Loading fleet state"; "path" => %path.display());

    match std::fs::metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(log, "State file missing, generating default fleet";
                  "path" => %path.display());
            save(path, &default_fleet()).with_context(|| {
                format!("error generating default {}", path.display())
            })?;
            info!(log, "Tip: edit the state file to add VMs or change their \
                        states for the next run";
                  "path" => %path.display());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("error stating {}", path.display()));
        }
    }

    let contents = std::fs::read(path)
        .with_context(|| format!("error reading {}", path.display()))?;
    let vms = serde_json::from_slice(&contents)
        .with_context(|| format!("error parsing {}", path.display()))?;
    Ok(vms)
}

/// Writes `vms` to `path` as pretty-printed JSON.
pub fn save(path: &Path, vms: &BTreeMap<VmId, Vm>) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(vms)
        .context("error serializing fleet state")?;
    std::fs::write(path, json)
        .with_context(|| format!("error writing {}", path.display()))
}
