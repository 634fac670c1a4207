// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Mount the raw images a migration produced, for inspection

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use diskmount::{DiskMount, MountReport, UnmountReport};
use vm_migration::{MigrationConfig, MigrationJob};

#[derive(Args, Clone)]
pub struct JobArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Name the migration was run with
    #[arg(short, long)]
    pub name: String,
}

/// losetup reports backing files by absolute path.
async fn absolute(image: &Path) -> Result<PathBuf> {
    tokio::fs::canonicalize(image)
        .await
        .with_context(|| format!("Could not find image {}", image.display()))
}

async fn job_images(args: &JobArgs) -> Result<(MigrationConfig, Vec<PathBuf>)> {
    let config = MigrationConfig::from_file(&args.config).await?;
    let job = MigrationJob::new(&args.name, config.job_dir(&args.name), false);
    let files = job.raw_files().await?;
    if files.is_empty() {
        bail!("No converted images in {}", job.work_dir.display());
    }
    let mut images = Vec::with_capacity(files.len());
    for file in files {
        images.push(absolute(&job.path_of(&file)).await?);
    }
    Ok((config, images))
}

fn print_mounted(image: &Path, report: &MountReport) {
    println!("{} -> {}", image.display(), report.loop_device);
    if let Some(volume_group) = &report.volume_group {
        println!("  volume group {}", volume_group);
    }
    for (device, target) in &report.mounted {
        println!("  {} on {}", device, target.display());
    }
    for (device, reason) in &report.skipped {
        println!("  {} skipped: {}", device, reason);
    }
}

fn print_unmounted(image: &Path, report: Option<&UnmountReport>) {
    match report {
        None => println!("{} was not attached", image.display()),
        Some(report) => {
            println!("{} detached from {}", image.display(), report.loop_device);
            for target in &report.unmounted {
                println!("  unmounted {}", target);
            }
            if let Some(original) = &report.restored_volume_group {
                println!("  volume group restored to {}", original);
            }
        }
    }
}

pub async fn mount_job(args: JobArgs) -> Result<()> {
    let (config, images) = job_images(&args).await?;
    let mounter = DiskMount::new(config.mount_root()).await?;
    for image in images {
        let report = mounter
            .mount(&image)
            .await
            .with_context(|| format!("Failed to mount {}", image.display()))?;
        print_mounted(&image, &report);
    }
    Ok(())
}

pub async fn unmount_job(args: JobArgs) -> Result<()> {
    let (config, images) = job_images(&args).await?;
    let mounter = DiskMount::new(config.mount_root()).await?;
    for image in images {
        let report = mounter
            .unmount(&image)
            .await
            .with_context(|| format!("Failed to unmount {}", image.display()))?;
        print_unmounted(&image, report.as_ref());
    }
    Ok(())
}

pub async fn mount_image(image: &Path, mount_root: PathBuf) -> Result<()> {
    let image = &absolute(image).await?;
    let mounter = DiskMount::new(mount_root).await?;
    let report = mounter
        .mount(image)
        .await
        .with_context(|| format!("Failed to mount {}", image.display()))?;
    print_mounted(image, &report);
    Ok(())
}

pub async fn unmount_image(image: &Path) -> Result<()> {
    let image = &absolute(image).await?;
    // Unmounting finds mount points from the live mount table, so the
    // root is not consulted.
    let mounter = DiskMount::new(PathBuf::new()).await?;
    let report = mounter
        .unmount(image)
        .await
        .with_context(|| format!("Failed to unmount {}", image.display()))?;
    print_unmounted(image, report.as_ref());
    Ok(())
}
