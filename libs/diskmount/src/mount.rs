// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Loop device and LVM lifecycle for a single image.
//!
//! Mount order is attach, rename, activate, mount. Teardown runs the
//! reverse: unmount, deactivate, restore the name, detach.

use std::path::{Path, PathBuf};

use command_exec::{CommandRunner, ExecutionError, Outcome, SudoRunner, Tolerated};
use tracing::{info, warn};

use crate::losetup::{self, LOSETUP, LoopDevice};
use crate::lvm::{self, LVSCAN, VGCHANGE, VGRENAME, VGSCAN};
use crate::mounts::{self, FINDMNT, MKDIR, MOUNT, UMOUNT};
use crate::{MountError, ParseError};

/// Mount failures that leave the image usable and are skipped.
pub const TOLERATED_MOUNT_FAILURES: [Tolerated; 2] = [
    Tolerated::new("already mounted", "already mounted"),
    Tolerated::new("unknown filesystem type", "unknown filesystem type"),
];

/// What [`DiskMount::mount`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountReport {
    pub loop_device: String,
    /// `true` when the image was already attached before this call
    pub reused_binding: bool,
    /// Name of the volume group after renaming
    pub volume_group: Option<String>,
    /// `(device, mount point)` of every logical volume now mounted
    pub mounted: Vec<(String, PathBuf)>,
    /// `(device, reason)` of logical volumes that were left alone
    pub skipped: Vec<(String, String)>,
}

/// What [`DiskMount::unmount`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountReport {
    pub loop_device: String,
    pub unmounted: Vec<String>,
    /// Name the volume group was restored to, if it was renamed
    pub restored_volume_group: Option<String>,
}

/// Mounts and unmounts raw disk images below `mount_root`.
pub struct DiskMount<R = SudoRunner> {
    runner: R,
    mount_root: PathBuf,
}

impl DiskMount<SudoRunner> {
    /// Build a mounter that runs everything through `sudo`.
    ///
    /// Fails straight away if passwordless `sudo` is not available.
    pub async fn new(mount_root: impl Into<PathBuf>) -> Result<Self, MountError> {
        let runner = SudoRunner::new().await?;
        Ok(Self::with_runner(runner, mount_root))
    }
}

impl<R: CommandRunner> DiskMount<R> {
    /// `runner` must already run commands with the privileges the loop
    /// and LVM tools need.
    pub fn with_runner(runner: R, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Attach `image`, activate its volume group under a collision-free
    /// name and mount every active logical volume.
    pub async fn mount(&self, image: &Path) -> Result<MountReport, MountError> {
        let devices = self.loop_devices().await?;

        let (device, reused_binding) = match losetup::find_binding(&devices, image) {
            Some(device) => {
                info!(
                    image = %image.display(),
                    loop_device = %device.name,
                    "Image already set up as loop device"
                );
                (device.clone(), true)
            }
            None => (self.attach(image).await?, false),
        };

        let mut report = MountReport {
            loop_device: device.name.clone(),
            reused_binding,
            ..Default::default()
        };

        info!(loop_device = %device.name, "Scanning LVM");
        let Some(found) = self.scan_volume_group(&device).await? else {
            info!(loop_device = %device.name, "No volume group found");
            return Ok(report);
        };

        let suffix = device.vg_suffix();
        let volume_group = if lvm::original_name(&found, &suffix).is_some() {
            info!(volume_group = %found, "Volume group already renamed");
            found
        } else {
            self.rename_volume_group(&device, &found, &lvm::renamed(&found, &suffix))
                .await?
        };

        self.change_active(&device, &volume_group, true).await?;

        for lv in self.active_logical_volumes(&device).await? {
            let target = mounts::mount_point(&self.mount_root, &lv);
            match self.mount_volume(&lv, &target).await? {
                None => report.mounted.push((lv, target)),
                Some(reason) => report.skipped.push((lv, reason)),
            }
        }

        report.volume_group = Some(volume_group);
        Ok(report)
    }

    /// Reverse [`DiskMount::mount`] for `image`.
    ///
    /// Returns `None` without touching anything when `image` is not
    /// attached to a loop device.
    pub async fn unmount(&self, image: &Path) -> Result<Option<UnmountReport>, MountError> {
        let devices = self.loop_devices().await?;
        let Some(device) = losetup::find_binding(&devices, image) else {
            info!(image = %image.display(), "Nothing to unmount from previous runs");
            return Ok(None);
        };

        let mut report = UnmountReport {
            loop_device: device.name.clone(),
            ..Default::default()
        };

        let volume_group = self.scan_volume_group(device).await?;
        let suffix = device.vg_suffix();

        for entry in self.mount_table().await? {
            if !mounts::source_has_suffix(&entry.source, &suffix) {
                continue;
            }
            self.runner.execute(&[UMOUNT, &entry.target]).await?;
            info!(source = %entry.source, target = %entry.target, "Unmounted");
            report.unmounted.push(entry.target);
        }

        if let Some(volume_group) = volume_group {
            self.change_active(device, &volume_group, false).await?;

            if let Some(original) = lvm::original_name(&volume_group, &suffix) {
                info!(volume_group = %volume_group, original = %original, "Restoring volume group name");
                self.rename_volume_group(device, &volume_group, original)
                    .await?;
                report.restored_volume_group = Some(original.to_string());
            }
        }

        self.runner
            .execute(&[LOSETUP, "--detach", &device.name])
            .await?;
        info!(image = %image.display(), loop_device = %device.name, "Detached");

        Ok(Some(report))
    }

    async fn loop_devices(&self) -> Result<Vec<LoopDevice>, MountError> {
        let output = self.runner.execute(&[LOSETUP, "--list", "--json"]).await?;
        Ok(losetup::parse_list(&output.stdout)?)
    }

    async fn attach(&self, image: &Path) -> Result<LoopDevice, MountError> {
        let path = image.to_string_lossy();
        let output = self
            .runner
            .execute(&[LOSETUP, "--partscan", "--find", "--show", &path])
            .await
            .map_err(|e| MountError::LoopSetup {
                image: path.to_string(),
                reason: e.to_string(),
            })?;

        let name = output.stdout.trim();
        if name.is_empty() {
            return Err(MountError::LoopSetup {
                image: path.to_string(),
                reason: "losetup did not report a device".to_string(),
            });
        }

        info!(image = %path, loop_device = %name, "Set up loop device");
        Ok(LoopDevice {
            name: name.to_string(),
            back_file: Some(path.to_string()),
        })
    }

    /// First volume group on `device`. Further groups are reported and
    /// left untouched.
    async fn scan_volume_group(&self, device: &LoopDevice) -> Result<Option<String>, MountError> {
        let filter = device.scan_filter();
        let output = self.runner.execute(&[VGSCAN, "--config", &filter]).await?;

        let mut groups = lvm::parse_vgscan(&output.stdout).into_iter();
        let first = groups.next();
        if let Some(vg) = &first {
            info!(volume_group = %vg, loop_device = %device.name, "Found volume group");
        }
        for ignored in groups {
            warn!(
                volume_group = %ignored,
                loop_device = %device.name,
                "Ignoring additional volume group; only the first is handled"
            );
        }
        Ok(first)
    }

    async fn rename_volume_group(
        &self,
        device: &LoopDevice,
        from: &str,
        to: &str,
    ) -> Result<String, MountError> {
        info!(from = %from, to = %to, "Renaming volume group");
        let filter = device.scan_filter();
        self.runner
            .execute(&[VGRENAME, "--config", &filter, from, to])
            .await?;
        Ok(to.to_string())
    }

    async fn change_active(
        &self,
        device: &LoopDevice,
        volume_group: &str,
        active: bool,
    ) -> Result<(), MountError> {
        let flag = if active { "y" } else { "n" };
        info!(volume_group = %volume_group, active = flag, "Changing volume group active status");
        let filter = device.scan_filter();
        self.runner
            .execute(&[VGCHANGE, "--config", &filter, "--activate", flag, volume_group])
            .await?;
        Ok(())
    }

    async fn active_logical_volumes(&self, device: &LoopDevice) -> Result<Vec<String>, MountError> {
        let filter = device.scan_filter();
        let output = self.runner.execute(&[LVSCAN, "--config", &filter]).await?;
        let volumes = lvm::parse_lvscan(&output.stdout);
        for lv in &volumes {
            info!(device = %lv, "Found logical volume");
        }
        Ok(volumes)
    }

    /// Mount `device` at `target`. Returns the reason when a tolerated
    /// failure meant it was skipped.
    async fn mount_volume(&self, device: &str, target: &Path) -> Result<Option<String>, MountError> {
        let target_str = target
            .to_str()
            .ok_or_else(|| ParseError(format!("mount point is not UTF-8: {}", target.display())))?;

        self.runner.execute(&[MKDIR, "-p", target_str]).await?;

        let argv = [MOUNT, device, target_str];
        match self
            .runner
            .execute_tolerating(&argv, &TOLERATED_MOUNT_FAILURES)
            .await?
        {
            Outcome::Completed(_) => {
                info!(device = %device, target = %target_str, "Mounted");
                Ok(None)
            }
            Outcome::Tolerated { condition, .. } => {
                info!(device = %device, target = %target_str, reason = condition.description, "Skipping device");
                Ok(Some(condition.description.to_string()))
            }
        }
    }

    async fn mount_table(&self) -> Result<Vec<mounts::MountEntry>, ExecutionError> {
        let output = self.runner.execute(&FINDMNT).await?;
        Ok(mounts::parse_findmnt(&output.stdout))
    }
}
