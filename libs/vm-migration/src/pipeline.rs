// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The migration pipeline
//!
//! Steps run in a fixed order and each one first checks whether its effect
//! already exists, so running the same job again after a failure picks up
//! where the last run stopped. Any step that cannot make progress aborts
//! the run; there are no retries.
//!
//! Only one run may work on a given VM or working directory at a time.
//! Nothing enforces this.

use std::sync::Arc;

use command_exec::{CommandRunner, LocalRunner};

use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::inventory::{DatastoreMap, EsxiInventory, HypervisorInventory, VIM_CMD};
use crate::job::{
    ArtifactState, ImageArtifact, MigrationJob, NetworkBinding, PowerState, SecurityGroup,
    SourceVm, size_gib,
};
use crate::openstack::{self, BlockDevice, CloudControl, OpenStackCli, ServerRequest};
use crate::prompt::{Confirmation, FixedConfirmation, TerminalConfirmation};
use crate::remote::{RemoteExec, SessionGuard, SshRemote};

const QEMU_IMG: &str = "qemu-img";
/// Files transferred from the VM directory
const DISK_GLOB: &str = "*.vmdk";
/// Suffix of a conversion that has not finished yet
const PARTIAL_SUFFIX: &str = ".part";

pub struct Pipeline {
    config: MigrationConfig,
    inventory: Arc<dyn HypervisorInventory>,
    remote: Arc<dyn RemoteExec>,
    cloud: Arc<dyn CloudControl>,
    converter: Arc<dyn CommandRunner>,
    confirmation: Arc<dyn Confirmation>,
}

impl Pipeline {
    pub fn new(
        config: MigrationConfig,
        inventory: Arc<dyn HypervisorInventory>,
        remote: Arc<dyn RemoteExec>,
        cloud: Arc<dyn CloudControl>,
        converter: Arc<dyn CommandRunner>,
        confirmation: Arc<dyn Confirmation>,
    ) -> Self {
        Self {
            config,
            inventory,
            remote,
            cloud,
            converter,
            confirmation,
        }
    }

    /// A pipeline talking to the configured ESXi host over ssh and to
    /// OpenStack through its CLI.
    ///
    /// With `assume_yes` the power-off is not confirmed interactively.
    pub fn from_config(config: MigrationConfig, assume_yes: bool) -> Self {
        let remote: Arc<dyn RemoteExec> = Arc::new(SshRemote::new(&config.esxi));
        let inventory = Arc::new(EsxiInventory::new(remote.clone(), config.esxi.host.clone()));
        let cloud = Arc::new(OpenStackCli::new(&config.openstack.env));
        let confirmation: Arc<dyn Confirmation> = if assume_yes {
            Arc::new(FixedConfirmation(true))
        } else {
            Arc::new(TerminalConfirmation)
        };
        Self::new(
            config,
            inventory,
            remote,
            cloud,
            Arc::new(LocalRunner::new()),
            confirmation,
        )
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// A job creating instance `name`, working in its own directory under
    /// the data path.
    pub fn job(&self, name: &str, force_copy: bool) -> MigrationJob {
        MigrationJob::new(name, self.config.job_dir(name), force_copy)
    }

    /// Run every step. The hypervisor session is released on return,
    /// whether the run succeeded or not.
    pub async fn run(&self, job: &mut MigrationJob) -> Result<(), MigrationError> {
        tracing::info!(
            job = %job.name,
            vm = %self.config.esxi.vm,
            work_dir = %job.work_dir.display(),
            "Starting migration"
        );

        let _session = self.initialize(job).await?;
        self.power_off(job).await?;
        self.copy_images(job).await?;
        self.convert_images(job).await?;
        self.import_images(job).await?;
        self.create_server(job).await?;

        tracing::info!(job = %job.name, "Migration finished");
        Ok(())
    }

    fn source<'a>(&self, job: &'a MigrationJob) -> Result<&'a SourceVm, MigrationError> {
        job.source
            .as_ref()
            .ok_or_else(|| MigrationError::resolution("VM", self.config.esxi.vm.clone()))
    }

    /// Resolve everything the later steps need before any of them changes
    /// anything.
    pub async fn initialize(&self, job: &mut MigrationJob) -> Result<SessionGuard, MigrationError> {
        tokio::fs::create_dir_all(&job.work_dir).await.map_err(|e| {
            MigrationError::io(format!("Could not create {}", job.work_dir.display()), e)
        })?;

        let session = self.remote.open_session().await?;

        let hosts = self.inventory.list_hosts().await?;
        let datastores = DatastoreMap::from_hosts(&hosts);
        tracing::debug!(hosts = hosts.len(), "Read hypervisor inventory");

        let vm_name = &self.config.esxi.vm;
        let vm = self
            .inventory
            .find_vm(vm_name)
            .await?
            .ok_or_else(|| MigrationError::resolution("VM", vm_name.clone()))?;
        let path = datastores
            .vm_directory(&vm.datastore_path)
            .ok_or_else(|| MigrationError::resolution("datastore path", vm.datastore_path.clone()))?;
        tracing::info!(vm = %vm.name, id = %vm.id, path = %path, state = ?vm.power_state, "Found VM");

        let shell = self.remote.run("true").await?;
        if !shell.success() {
            return Err(MigrationError::Connectivity {
                host: self.config.esxi.host.clone(),
                reason: shell.stderr.trim().to_string(),
            });
        }

        job.source = Some(SourceVm {
            name: vm.name,
            id: vm.id,
            path,
            power_state: vm.power_state,
        });

        job.networks.clear();
        for spec in self.config.networks()? {
            let id = openstack::network_id(self.cloud.as_ref(), &spec.name).await?;
            tracing::debug!(network = %spec.name, id = %id, "Resolved network");
            job.networks.push(NetworkBinding {
                name: spec.name,
                id,
                fixed_ip: spec.fixed_ip,
            });
        }

        let group = &self.config.openstack.target.security_group;
        let id = openstack::security_group_id(self.cloud.as_ref(), group).await?;
        tracing::debug!(security_group = %group, id = %id, "Resolved security group");
        job.security_group = Some(SecurityGroup {
            name: group.clone(),
            id,
        });

        Ok(session)
    }

    pub async fn power_off(&self, job: &mut MigrationJob) -> Result<(), MigrationError> {
        let vm = self.source(job)?;
        if vm.power_state == PowerState::Off {
            tracing::info!(vm = %vm.name, "VM is already powered off");
            return Ok(());
        }

        if !self.confirmation.confirm_power_off(vm)? {
            return Err(MigrationError::ConfirmationDeclined {
                vm: vm.name.clone(),
            });
        }

        tracing::info!(vm = %vm.name, id = %vm.id, "Powering off VM");
        let output = self
            .remote
            .run(&format!("{} vmsvc/power.off {}", VIM_CMD, vm.id))
            .await?;
        if !output.success() {
            for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
                tracing::error!(vm = %vm.name, "{}", line);
            }
            return Err(MigrationError::PowerOffFailed {
                vm: vm.name.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if let Some(source) = job.source.as_mut() {
            source.power_state = PowerState::Off;
        }
        Ok(())
    }

    /// Fetch the disk files, recording each one as a copied artifact.
    pub async fn copy_images(&self, job: &mut MigrationJob) -> Result<(), MigrationError> {
        let existing = job.disk_files().await?;
        if !existing.is_empty() && !job.force_copy {
            tracing::info!(files = ?existing, "Disk files already copied, skipping copy");
            job.record_copied(&existing);
            return Ok(());
        }

        let vm = self.source(job)?;
        tracing::info!(from = %vm.path, to = %job.work_dir.display(), "Copying disk files");

        // The remote paces partial reports.
        let progress = |file: &str, total: u64, sent: u64| {
            if sent >= total {
                tracing::info!(file, bytes = total, "Copied");
            } else {
                let percent = sent.saturating_mul(100) / total.max(1);
                tracing::info!(file, sent, total, "Copying: {}%", percent);
            }
        };
        self.remote
            .copy_files_matching(&vm.path, DISK_GLOB, &job.work_dir, &progress)
            .await?;

        let copied = job.disk_files().await?;
        if copied.is_empty() {
            return Err(MigrationError::resolution(
                "disk files",
                format!("{}/{}", vm.path, DISK_GLOB),
            ));
        }
        job.record_copied(&copied);
        Ok(())
    }

    /// Convert every copied disk that has no raw image yet.
    pub async fn convert_images(&self, job: &mut MigrationJob) -> Result<(), MigrationError> {
        let converted = job.raw_files().await?;

        for idx in 0..job.artifacts.len() {
            let artifact = &job.artifacts[idx];
            if *artifact.state() != ArtifactState::Copied {
                continue;
            }
            let disk = artifact.disk_name().to_string();
            let raw = artifact.raw_name();
            if converted.contains(&raw) {
                tracing::info!(disk = %disk, "Already converted");
                job.artifacts[idx].mark_converted();
                continue;
            }

            let source = job.path_of(&disk);
            let target = job.path_of(&raw);
            let partial = job.path_of(&format!("{}{}", raw, PARTIAL_SUFFIX));
            let (source_arg, partial_arg) =
                (source.display().to_string(), partial.display().to_string());

            tracing::info!(disk = %disk, "Converting to raw");
            self.converter
                .execute(&[
                    QEMU_IMG,
                    "convert",
                    "-f",
                    "vmdk",
                    "-O",
                    "raw",
                    &source_arg,
                    &partial_arg,
                ])
                .await?;

            tokio::fs::rename(&partial, &target).await.map_err(|e| {
                MigrationError::io(format!("Could not move {} into place", partial.display()), e)
            })?;
            job.artifacts[idx].mark_converted();
        }
        Ok(())
    }

    /// Upload every converted image the cloud does not have yet.
    ///
    /// Raw files in the working directory count even when their disk file
    /// is gone, so the artifact list afterwards follows the raw files.
    pub async fn import_images(&self, job: &mut MigrationJob) -> Result<(), MigrationError> {
        let existing = openstack::list_images(self.cloud.as_ref()).await?;

        let mut artifacts = Vec::new();
        for raw in job.raw_files().await? {
            let known = job.artifacts.iter().position(|a| a.raw_name() == raw);
            let mut artifact = match known {
                Some(idx) => job.artifacts.swap_remove(idx),
                None => ImageArtifact::converted(&raw),
            };
            artifact.mark_converted();
            if artifact.image().is_some() {
                artifacts.push(artifact);
                continue;
            }

            match existing.iter().find(|image| image.name == raw) {
                Some(image) => {
                    let size = image.size.ok_or_else(|| MigrationError::ImageSizeUnavailable {
                        name: raw.clone(),
                        id: image.id.clone(),
                    })?;
                    tracing::info!(image = %raw, id = %image.id, size, "Image already imported");
                    artifact.mark_imported(image.id.clone(), size);
                }
                None => {
                    let path = job.path_of(&raw);
                    let size = tokio::fs::metadata(&path)
                        .await
                        .map_err(|e| MigrationError::io(format!("Could not stat {}", path.display()), e))?
                        .len();
                    tracing::info!(image = %raw, size, "Importing image");
                    let id = openstack::create_image(self.cloud.as_ref(), &raw, &path).await?;
                    tracing::info!(image = %raw, id = %id, "Imported image");
                    artifact.mark_imported(id, size);
                }
            }
            artifacts.push(artifact);
        }
        job.artifacts = artifacts;
        Ok(())
    }

    /// Boot the instance from the last image, attaching the others as
    /// additional volumes.
    pub async fn create_server(&self, job: &MigrationJob) -> Result<(), MigrationError> {
        let mut images: Vec<(&str, u64)> =
            job.artifacts.iter().filter_map(ImageArtifact::image).collect();
        let (boot_id, boot_size) = images.pop().ok_or(MigrationError::NoArtifacts)?;

        if let Some(id) = openstack::find_server(self.cloud.as_ref(), &job.name).await? {
            tracing::info!(server = %job.name, id = %id, "Server already exists");
            return Ok(());
        }

        let security_group = job
            .security_group
            .as_ref()
            .ok_or_else(|| {
                MigrationError::resolution(
                    "security group",
                    self.config.openstack.target.security_group.clone(),
                )
            })?;

        let request = ServerRequest {
            name: job.name.clone(),
            flavor: self.config.openstack.target.flavor.clone(),
            boot_image_id: boot_id.to_string(),
            boot_size_gib: size_gib(boot_size),
            security_group_id: security_group.id.clone(),
            nics: job
                .networks
                .iter()
                .map(|n| (n.id.clone(), n.fixed_ip.clone()))
                .collect(),
            block_devices: images
                .into_iter()
                .map(|(id, size)| BlockDevice {
                    image_id: id.to_string(),
                    size_gib: size_gib(size),
                })
                .collect(),
            compute_api_version: self.config.openstack.target.compute_api_version.clone(),
        };

        tracing::info!(
            server = %job.name,
            boot_image = %request.boot_image_id,
            boot_gib = request.boot_size_gib,
            volumes = request.block_devices.len(),
            "Creating server"
        );
        let id = openstack::create_server(self.cloud.as_ref(), &request).await?;
        tracing::info!(server = %job.name, id = %id, "Created server");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::fakes::{FakeCloud, FakeConverter, FakeInventory, FakeRemote, config};
    use crate::inventory::{HostInfo, VmInfo};
    use crate::job::GIB;
    use crate::openstack::CloudOutput;
    use command_exec::CommandOutput;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    struct Harness {
        remote: Arc<FakeRemote>,
        cloud: Arc<FakeCloud>,
        converter: Arc<FakeConverter>,
        pipeline: Pipeline,
    }

    fn resolving_cloud() -> FakeCloud {
        let cloud = FakeCloud::new();
        cloud.respond("network show lan", CloudOutput::from_stdout("id: net-lan\n"));
        cloud.respond("network show dmz", CloudOutput::from_stdout("id: net-dmz\n"));
        cloud.respond(
            "security group show default",
            CloudOutput::from_stdout("id: sg-default\n"),
        );
        cloud
    }

    fn harness(power_state: PowerState, confirm: bool) -> Harness {
        harness_with(power_state, confirm, resolving_cloud())
    }

    fn harness_with(power_state: PowerState, confirm: bool, cloud: FakeCloud) -> Harness {
        let inventory = Arc::new(FakeInventory {
            hosts: vec![HostInfo {
                name: "esxi01".into(),
                datastore_mounts: BTreeMap::from([(
                    "datastore1".to_string(),
                    "/vmfs/volumes/5e8f1a2b".to_string(),
                )]),
            }],
            vms: vec![VmInfo {
                id: "12".into(),
                name: "web01".into(),
                power_state,
                datastore_path: "[datastore1] web01/web01.vmx".into(),
            }],
        });
        let remote = Arc::new(FakeRemote::new());
        let cloud = Arc::new(cloud);
        let converter = Arc::new(FakeConverter::default());

        let pipeline = Pipeline::new(
            config(),
            inventory,
            remote.clone(),
            cloud.clone(),
            converter.clone(),
            Arc::new(FixedConfirmation(confirm)),
        );
        Harness {
            remote,
            cloud,
            converter,
            pipeline,
        }
    }

    fn touch(dir: &Path, name: &str, len: usize) {
        std::fs::write(dir.join(name), vec![0u8; len]).unwrap();
    }

    fn image_listing(images: &[(&str, &str, Option<u64>)]) -> CloudOutput {
        let rows: String = images
            .iter()
            .map(|(id, name, size)| {
                let size = size.map(|s| s.to_string()).unwrap_or_else(|| "null".into());
                format!("- ID: {}\n  Name: {}\n  Size: {}\n", id, name, size)
            })
            .collect();
        CloudOutput::from_stdout(if rows.is_empty() { "[]\n".to_string() } else { rows })
    }

    #[tokio::test]
    async fn migrates_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::On, true);
        h.remote.serve_file("a-disc1.vmdk", b"one");
        h.remote.serve_file("a-disc2.vmdk", b"two");
        h.remote.serve_file("a-disc1-flat.vmdk", b"data");
        h.cloud.respond("image list", image_listing(&[]));
        h.cloud
            .respond_once("image create", CloudOutput::from_stdout("id: img-1\n"));
        h.cloud
            .respond_once("image create", CloudOutput::from_stdout("id: img-2\n"));
        h.cloud.respond(
            "server show web01",
            CloudOutput::failed("No server with a name or ID of 'web01' exists."),
        );
        h.cloud.respond(
            "--os-compute-api-version",
            CloudOutput::from_stdout("id: srv-1\n"),
        );

        let mut job = MigrationJob::new("web01", dir.path(), false);
        h.pipeline.run(&mut job).await.unwrap();

        assert_eq!(
            job.source.as_ref().unwrap().path,
            "/vmfs/volumes/5e8f1a2b/web01"
        );
        assert!(h.remote.calls().contains(&"/bin/vim-cmd vmsvc/power.off 12".to_string()));
        assert_eq!(h.remote.copies(), vec!["/vmfs/volumes/5e8f1a2b/web01/*.vmdk"]);
        assert_eq!(h.converter.calls().len(), 2);
        assert!(h.converter.calls()[0].starts_with("qemu-img convert -f vmdk -O raw"));

        let names: Vec<String> = job.artifacts.iter().map(|a| a.raw_name()).collect();
        assert_eq!(names, vec!["a-disc1.vmdk.raw", "a-disc2.vmdk.raw"]);
        assert_eq!(job.artifacts[0].image(), Some(("img-1", 3)));

        let creates = h.cloud.calls_starting_with("--os-compute-api-version");
        assert_eq!(creates.len(), 1);
        let create = &creates[0];
        assert!(create.contains("--image img-2 --boot-from-volume 0"));
        assert!(create.contains("--block-device uuid=img-1,"));
        assert!(!create.contains("uuid=img-2"));
        assert!(create.contains("--security-group sg-default"));
        assert!(create.contains("--nic net-id=net-lan --nic net-id=net-dmz,v4-fixed-ip=192.0.2.10"));
        assert!(create.ends_with(" web01"));

        assert_eq!(h.remote.sessions_opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.sessions_released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rerun_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a-disc1.vmdk", "a-disc2.vmdk", "a-disc1.vmdk.raw", "a-disc2.vmdk.raw"] {
            touch(dir.path(), name, 1);
        }
        let h = harness(PowerState::Off, false);
        h.cloud.respond(
            "image list",
            image_listing(&[
                ("img-1", "a-disc1.vmdk.raw", Some(GIB)),
                ("img-2", "a-disc2.vmdk.raw", Some(2 * GIB)),
            ]),
        );
        h.cloud
            .respond("server show web01", CloudOutput::from_stdout("id: srv-1\n"));

        let mut job = MigrationJob::new("web01", dir.path(), false);
        h.pipeline.run(&mut job).await.unwrap();

        assert!(!h.remote.calls().iter().any(|c| c.contains("power.off")));
        assert!(h.remote.copies().is_empty());
        assert!(h.converter.calls().is_empty());
        assert!(h.cloud.calls_starting_with("image create").is_empty());
        assert!(h.cloud.calls_starting_with("--os-compute-api-version").is_empty());
        assert_eq!(job.artifacts[1].image(), Some(("img-2", 2 * GIB)));
    }

    #[tokio::test]
    async fn boot_volume_size_rounds_down() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::Off, false);
        h.cloud.respond(
            "image list",
            image_listing(&[
                ("img-1", "a-disc1.vmdk.raw", Some(5 * GIB - 1)),
                ("img-2", "a-disc2.vmdk.raw", Some(5_368_709_120)),
            ]),
        );
        h.cloud.respond(
            "--os-compute-api-version",
            CloudOutput::from_stdout("id: srv-1\n"),
        );
        for name in ["a-disc1.vmdk.raw", "a-disc2.vmdk.raw"] {
            touch(dir.path(), name, 1);
        }

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let _session = h.pipeline.initialize(&mut job).await.unwrap();
        h.pipeline.import_images(&mut job).await.unwrap();
        h.pipeline.create_server(&job).await.unwrap();

        let create = &h.cloud.calls_starting_with("--os-compute-api-version")[0];
        assert!(create.contains("--image img-2 --boot-from-volume 5 "));
        assert!(create.contains("uuid=img-1,source_type=image,destination_type=volume,volume_size=4"));
    }

    #[tokio::test]
    async fn existing_disks_skip_copy_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a-disc1.vmdk", 1);
        let h = harness(PowerState::Off, false);

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let _session = h.pipeline.initialize(&mut job).await.unwrap();
        h.pipeline.copy_images(&mut job).await.unwrap();
        assert!(h.remote.copies().is_empty());
        assert_eq!(job.artifacts, vec![ImageArtifact::copied("a-disc1.vmdk")]);

        job.force_copy = true;
        h.pipeline.copy_images(&mut job).await.unwrap();
        assert_eq!(h.remote.copies().len(), 1);
        assert_eq!(job.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn copy_without_disks_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::Off, false);

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let _session = h.pipeline.initialize(&mut job).await.unwrap();
        let err = h.pipeline.copy_images(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::Resolution { kind: "disk files", .. }));
    }

    #[tokio::test]
    async fn conversion_advances_copied_disks() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a-disc1.vmdk", "a-disc2.vmdk", "a-disc2.vmdk.raw"] {
            touch(dir.path(), name, 1);
        }
        let h = harness(PowerState::Off, false);

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let _session = h.pipeline.initialize(&mut job).await.unwrap();
        h.pipeline.copy_images(&mut job).await.unwrap();
        h.pipeline.convert_images(&mut job).await.unwrap();

        assert_eq!(h.converter.calls().len(), 1);
        assert!(h.converter.calls()[0].contains("a-disc1.vmdk.raw.part"));
        assert!(
            job.artifacts
                .iter()
                .all(|a| *a.state() == ArtifactState::Converted)
        );
        assert_eq!(
            job.raw_files().await.unwrap(),
            vec!["a-disc1.vmdk.raw", "a-disc2.vmdk.raw"]
        );
    }

    #[tokio::test]
    async fn failed_conversion_leaves_no_raw_image() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a-disc1.vmdk", 1);
        let mut h = harness(PowerState::Off, false);
        let converter = Arc::new(FakeConverter::failing(1, "qemu-img: Could not open"));
        h.pipeline.converter = converter.clone();

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let _session = h.pipeline.initialize(&mut job).await.unwrap();
        h.pipeline.copy_images(&mut job).await.unwrap();
        let err = h.pipeline.convert_images(&mut job).await.unwrap_err();

        assert!(matches!(err, MigrationError::ExternalTool { .. }));
        assert_eq!(converter.calls().len(), 1);
        assert!(job.raw_files().await.unwrap().is_empty());
        assert!(dir.path().join("a-disc1.vmdk.raw.part").exists());
        assert!(!dir.path().join("a-disc1.vmdk.raw").exists());
        assert_eq!(job.artifacts[0].state(), &ArtifactState::Copied);
    }

    #[tokio::test]
    async fn missing_converter_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(PowerState::Off, false);
        h.remote.serve_file("a-disc1.vmdk", b"one");
        h.pipeline.converter = Arc::new(FakeConverter::missing());

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();

        assert!(matches!(err, MigrationError::ExternalTool { .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(job.raw_files().await.unwrap().is_empty());
        assert!(h.cloud.calls_starting_with("image").is_empty());
    }

    #[tokio::test]
    async fn imported_image_without_size_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a-disc1.vmdk.raw", 1);
        let h = harness(PowerState::Off, false);
        h.cloud.respond(
            "image list",
            image_listing(&[("img-1", "a-disc1.vmdk.raw", None)]),
        );

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.import_images(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::ImageSizeUnavailable { .. }));
        assert!(h.cloud.calls_starting_with("image create").is_empty());
    }

    #[tokio::test]
    async fn declined_power_off_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::On, false);

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::ConfirmationDeclined { .. }));
        assert_eq!(err.exit_code(), 2);
        assert!(!h.remote.calls().iter().any(|c| c.contains("power.off")));
        assert_eq!(h.remote.sessions_released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_power_off_has_its_own_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::On, true);
        h.remote.respond(
            "/bin/vim-cmd vmsvc/power.off",
            CommandOutput::failed(1, "vim.fault.InvalidPowerState"),
        );

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::PowerOffFailed { code: Some(1), .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn unknown_vm_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(PowerState::Off, false);
        let mut config = config();
        config.esxi.vm = "web02".into();
        h.pipeline.config = config;

        let mut job = MigrationJob::new("web02", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::Resolution { kind: "VM", .. }));
    }

    #[tokio::test]
    async fn unresolved_network_stops_before_any_change() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::new();
        cloud.respond("network show lan", CloudOutput::from_stdout("id: net-lan\n"));
        cloud.respond("network show dmz", CloudOutput::failed("No Network found for dmz"));
        let h = harness_with(PowerState::On, true, cloud);

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::Resolution { kind: "network", .. }));
        assert!(!h.remote.calls().iter().any(|c| c.contains("power.off")));
        assert!(h.cloud.calls_starting_with("security group").is_empty());
    }

    #[tokio::test]
    async fn no_images_means_no_server() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::Off, false);
        let job = MigrationJob::new("web01", dir.path(), false);

        let err = h.pipeline.create_server(&job).await.unwrap_err();
        assert!(matches!(err, MigrationError::NoArtifacts));
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_shell_is_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(PowerState::Off, false);
        h.remote.respond("true", CommandOutput::failed(1, "Permission denied"));

        let mut job = MigrationJob::new("web01", dir.path(), false);
        let err = h.pipeline.run(&mut job).await.unwrap_err();
        assert!(matches!(err, MigrationError::Connectivity { .. }));
    }
}
