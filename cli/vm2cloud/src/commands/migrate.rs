// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use vm_migration::{MigrationConfig, Pipeline};

#[derive(Args, Clone)]
pub struct MigrateArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Name of the server to create
    #[arg(short, long)]
    pub name: String,

    /// Copy the disks again even if copies already exist
    #[arg(long)]
    pub force_copy: bool,

    /// Power off the VM without asking
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn run(args: MigrateArgs) -> Result<()> {
    let config = MigrationConfig::from_file(&args.config).await?;
    let pipeline = Pipeline::from_config(config, args.yes);
    let mut job = pipeline.job(&args.name, args.force_copy);

    pipeline.run(&mut job).await?;

    println!("Server {} created from VM {}", job.name, pipeline.config().esxi.vm);
    Ok(())
}
