// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Make the filesystems inside a raw disk image reachable, and put
//! everything back afterwards.
//!
//! An image is attached as a partition-scanning loop device. Any LVM
//! volume group found on it is renamed with a suffix derived from the loop
//! device before activation, so it cannot collide with a volume group of
//! the same name on the host. All LVM commands run with a device filter
//! that admits only the attached loop device.
//!
//! Nothing is remembered between calls: both [`DiskMount::mount`] and
//! [`DiskMount::unmount`] discover loop devices, volume groups and mounts
//! from the live system, so they behave the same against state left by an
//! earlier (possibly crashed) run.

pub mod losetup;
pub mod lvm;
pub mod mount;
pub mod mounts;

pub use losetup::LoopDevice;
pub use mount::{DiskMount, MountReport, UnmountReport};

use command_exec::ExecutionError;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to parse output: {0}")]
pub struct ParseError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum MountError {
    #[error("Command execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Could not set up image {image} as loop device: {reason}")]
    LoopSetup { image: String, reason: String },
}
