// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! vm2cloud - migrate a virtual machine from ESXi to OpenStack

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vm_migration::MigrationError;
use vm_migration::error::EXIT_FAILURE;

mod commands;

const LOG_TARGETS: &[&str] = &["vm2cloud", "vm_migration", "diskmount", "command_exec"];

#[derive(Parser)]
#[command(
    name = "vm2cloud",
    version,
    about = "Migrate a virtual machine from ESXi to OpenStack",
    long_about = "Copy a VM's disks off an ESXi host, convert them to raw images, \
                  upload them to OpenStack and boot a server from them. \
                  Every step is skipped when its result already exists, so a \
                  failed migration can simply be run again."
)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the configured VM
    Migrate(commands::migrate::MigrateArgs),

    /// Mount the converted images of a migration
    Mount(commands::images::JobArgs),

    /// Unmount the converted images of a migration
    Unmount(commands::images::JobArgs),

    /// Mount a single raw image
    MountImage {
        /// Raw disk image
        image: PathBuf,

        /// Directory below which logical volumes are mounted
        #[arg(long, env = "VM2CLOUD_MOUNT_PATH")]
        mount_root: PathBuf,
    },

    /// Unmount a single raw image mounted with mount-image
    UnmountImage {
        /// Raw disk image
        image: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default = LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Migrate(args) => commands::migrate::run(args).await,
        Commands::Mount(args) => commands::images::mount_job(args).await,
        Commands::Unmount(args) => commands::images::unmount_job(args).await,
        Commands::MountImage { image, mount_root } => {
            commands::images::mount_image(&image, mount_root).await
        }
        Commands::UnmountImage { image } => commands::images::unmount_image(&image).await,
    }
}

/// Exit status for a failed run. Migration errors carry their own.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<MigrationError>()
        .map(MigrationError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::from(u8::try_from(exit_code(&err)).unwrap_or(1))
        }
    }
}
