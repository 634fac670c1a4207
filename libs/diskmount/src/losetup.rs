// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Loop device bindings as reported by `losetup --list --json`.

use std::path::Path;

use serde::Deserialize;

use crate::ParseError;
use crate::lvm;

pub const LOSETUP: &str = "losetup";

/// A loop device and the file backing it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoopDevice {
    /// Device node, e.g. `/dev/loop3`
    pub name: String,
    #[serde(rename = "back-file")]
    pub back_file: Option<String>,
}

impl LoopDevice {
    /// LVM `--config` device filter admitting only this device's partitions.
    pub fn scan_filter(&self) -> String {
        lvm::scan_filter(&self.name)
    }

    /// Suffix appended to volume group names found on this device.
    pub fn vg_suffix(&self) -> String {
        lvm::vg_suffix(&self.name)
    }

    pub fn is_backed_by(&self, image: &Path) -> bool {
        self.back_file
            .as_deref()
            .is_some_and(|f| Path::new(f) == image)
    }
}

#[derive(Debug, Deserialize)]
struct LosetupList {
    #[serde(default)]
    loopdevices: Vec<LoopDevice>,
}

/// Parse `losetup --list --json`. No output means no loop devices.
pub fn parse_list(stdout: &str) -> Result<Vec<LoopDevice>, ParseError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }

    let list: LosetupList = serde_json::from_str(stdout)
        .map_err(|e| ParseError(format!("losetup json: {}", e)))?;
    Ok(list.loopdevices)
}

pub fn find_binding<'a>(devices: &'a [LoopDevice], image: &Path) -> Option<&'a LoopDevice> {
    devices.iter().find(|d| d.is_backed_by(image))
}
