// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Hypervisor inventory: hosts, datastores and VMs

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::error::MigrationError;
use crate::job::PowerState;
use crate::remote::{RemoteExec, shell_quote};

pub const VIM_CMD: &str = "/bin/vim-cmd";

static VM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // constant pattern
    Regex::new(r"^(\d+)\s+(.+?)\s+(\[[^\]]+\]\s+.+?\.vmx)(\s|$)").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    /// Datastore label to its mount path on the host
    pub datastore_mounts: BTreeMap<String, String>,
}

/// A VM as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    /// Path of the VM's config file, like `[datastore1] web01/web01.vmx`
    pub datastore_path: String,
}

#[async_trait]
pub trait HypervisorInventory: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<HostInfo>, MigrationError>;

    /// The VM whose name is exactly `name`, if there is one.
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, MigrationError>;
}

/// Datastore labels of every host, mapped to their mount paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatastoreMap(BTreeMap<String, String>);

impl DatastoreMap {
    pub fn from_hosts(hosts: &[HostInfo]) -> Self {
        Self(
            hosts
                .iter()
                .flat_map(|h| h.datastore_mounts.clone())
                .collect(),
        )
    }

    /// Absolute directory of a `[label] dir/file.vmx` path.
    ///
    /// Returns `None` when the path has no datastore label or the label is
    /// unknown.
    pub fn vm_directory(&self, datastore_path: &str) -> Option<String> {
        let rest = datastore_path.trim().strip_prefix('[')?;
        let (label, relative) = rest.split_once(']')?;
        let mount = self.0.get(label)?;

        let full = Path::new(mount).join(relative.trim_start());
        let normalized = normalize(&full);
        normalized
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.display().to_string())
    }
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Parse `esxcli --formatter=csv storage filesystem list`.
pub fn parse_filesystems(stdout: &str) -> BTreeMap<String, String> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return BTreeMap::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let (Some(mount_idx), Some(name_idx)) = (
        columns.iter().position(|c| *c == "MountPoint"),
        columns.iter().position(|c| *c == "VolumeName"),
    ) else {
        return BTreeMap::new();
    };

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let mount = fields.get(mount_idx)?;
            let name = fields.get(name_idx)?;
            (!name.is_empty() && !mount.is_empty()).then(|| (name.to_string(), mount.to_string()))
        })
        .collect()
}

/// Parse `vim-cmd vmsvc/getallvms` into `(vmid, name, datastore path)`.
pub fn parse_getallvms(stdout: &str) -> Vec<(String, String, String)> {
    stdout
        .lines()
        .filter_map(|line| VM_LINE.captures(line))
        .map(|c| (c[1].to_string(), c[2].to_string(), c[3].to_string()))
        .collect()
}

/// Parse `vim-cmd vmsvc/power.getstate`.
pub fn parse_power_state(stdout: &str) -> Option<PowerState> {
    let state = stdout.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    match state {
        "Powered on" => Some(PowerState::On),
        "Powered off" => Some(PowerState::Off),
        "Suspended" => Some(PowerState::Suspended),
        _ => None,
    }
}

/// Inventory of a standalone ESXi host, read with its own management
/// tools over the remote shell.
pub struct EsxiInventory {
    remote: Arc<dyn RemoteExec>,
    host: String,
}

impl EsxiInventory {
    pub fn new(remote: Arc<dyn RemoteExec>, host: impl Into<String>) -> Self {
        Self {
            remote,
            host: host.into(),
        }
    }

    async fn checked(&self, command: &str) -> Result<String, MigrationError> {
        let output = self.remote.run(command).await?;
        if !output.success() {
            return Err(MigrationError::ExternalTool {
                tool: command.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl HypervisorInventory for EsxiInventory {
    async fn list_hosts(&self) -> Result<Vec<HostInfo>, MigrationError> {
        let stdout = self
            .checked("esxcli --formatter=csv storage filesystem list")
            .await?;
        Ok(vec![HostInfo {
            name: self.host.clone(),
            datastore_mounts: parse_filesystems(&stdout),
        }])
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, MigrationError> {
        let stdout = self
            .checked(&format!("{} vmsvc/getallvms", VIM_CMD))
            .await?;

        let Some((id, vm_name, datastore_path)) = parse_getallvms(&stdout)
            .into_iter()
            .find(|(_, vm_name, _)| vm_name == name)
        else {
            return Ok(None);
        };

        let state = self
            .checked(&format!("{} vmsvc/power.getstate {}", VIM_CMD, shell_quote(&id)))
            .await?;
        let power_state = parse_power_state(&state).ok_or_else(|| MigrationError::ExternalTool {
            tool: "vim-cmd vmsvc/power.getstate".to_string(),
            stderr: format!("unrecognised power state: {}", state.trim()),
        })?;

        Ok(Some(VmInfo {
            id,
            name: vm_name,
            power_state,
            datastore_path,
        }))
    }
}
