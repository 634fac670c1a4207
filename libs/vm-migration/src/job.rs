// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! State of one migration run and the files it leaves in its working
//! directory.
//!
//! Nothing here is persisted. A re-run rebuilds the same state from the
//! files on disk and what the cloud already has.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::MigrationError;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Suffix appended to a disk file name for its converted image.
pub const RAW_SUFFIX: &str = ".raw";

static DISK_FILE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // constant pattern
    Regex::new(r"^.*disc\d+\.vmdk$").unwrap()
});

static RAW_FILE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // constant pattern
    Regex::new(r"^.*disc\d+\.vmdk\.raw$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
}

/// The VM on the hypervisor, resolved once during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceVm {
    pub name: String,
    /// Hypervisor managed object id
    pub id: String,
    /// Absolute directory holding the VM's files on the hypervisor
    pub path: String,
    pub power_state: PowerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub name: String,
    pub id: String,
    /// `None` lets the cloud assign an address
    pub fixed_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub name: String,
    pub id: String,
}

/// How far a disk has progressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Copied,
    Converted,
    Imported { image_id: String, size_bytes: u64 },
}

/// One disk of the source VM.
///
/// The only transitions are forward ones; marking an artifact with a state
/// it has already passed does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    disk: String,
    state: ArtifactState,
}

impl ImageArtifact {
    /// A disk copied from the hypervisor, named like `web01-disc1.vmdk`.
    pub fn copied(disk: impl Into<String>) -> Self {
        Self {
            disk: disk.into(),
            state: ArtifactState::Copied,
        }
    }

    /// A disk known by its converted file, named like `web01-disc1.vmdk.raw`.
    pub fn converted(raw_name: &str) -> Self {
        Self {
            disk: raw_name.strip_suffix(RAW_SUFFIX).unwrap_or(raw_name).to_string(),
            state: ArtifactState::Converted,
        }
    }

    pub fn disk_name(&self) -> &str {
        &self.disk
    }

    pub fn raw_name(&self) -> String {
        format!("{}{}", self.disk, RAW_SUFFIX)
    }

    pub fn state(&self) -> &ArtifactState {
        &self.state
    }

    pub fn mark_converted(&mut self) {
        if self.state == ArtifactState::Copied {
            self.state = ArtifactState::Converted;
        }
    }

    pub fn mark_imported(&mut self, image_id: impl Into<String>, size_bytes: u64) {
        if !matches!(self.state, ArtifactState::Imported { .. }) {
            self.state = ArtifactState::Imported {
                image_id: image_id.into(),
                size_bytes,
            };
        }
    }

    /// Cloud image id and size, once imported.
    pub fn image(&self) -> Option<(&str, u64)> {
        match &self.state {
            ArtifactState::Imported {
                image_id,
                size_bytes,
            } => Some((image_id.as_str(), *size_bytes)),
            _ => None,
        }
    }
}

/// Whole gigabytes in `bytes`, rounded down.
pub fn size_gib(bytes: u64) -> u64 {
    bytes / GIB
}

/// One migration run.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    /// Name of the instance to create
    pub name: String,
    pub work_dir: PathBuf,
    pub force_copy: bool,
    pub source: Option<SourceVm>,
    pub networks: Vec<NetworkBinding>,
    pub security_group: Option<SecurityGroup>,
    /// Disks of the source VM, in lexical order of their file names
    pub artifacts: Vec<ImageArtifact>,
}

impl MigrationJob {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>, force_copy: bool) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            force_copy,
            source: None,
            networks: Vec::new(),
            security_group: None,
            artifacts: Vec::new(),
        }
    }

    /// Copied disk files in the working directory, sorted.
    pub async fn disk_files(&self) -> Result<Vec<String>, MigrationError> {
        matching_files(&self.work_dir, &DISK_FILE).await
    }

    /// Converted image files in the working directory, sorted.
    pub async fn raw_files(&self) -> Result<Vec<String>, MigrationError> {
        matching_files(&self.work_dir, &RAW_FILE).await
    }

    /// Track `disks` as copied, leaving disks already tracked alone.
    pub fn record_copied(&mut self, disks: &[String]) {
        for disk in disks {
            if !self.artifacts.iter().any(|a| a.disk_name() == disk) {
                self.artifacts.push(ImageArtifact::copied(disk.as_str()));
            }
        }
        self.artifacts.sort_by(|a, b| a.disk_name().cmp(b.disk_name()));
    }

    pub fn path_of(&self, file: &str) -> PathBuf {
        self.work_dir.join(file)
    }
}

async fn matching_files(dir: &Path, pattern: &Regex) -> Result<Vec<String>, MigrationError> {
    let list_error = |e| MigrationError::io(format!("Could not list {}", dir.display()), e);
    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_error)?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && pattern.is_match(name)
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
