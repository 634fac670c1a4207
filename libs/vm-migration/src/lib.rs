// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Move one virtual machine from a standalone ESXi host to OpenStack.
//!
//! The [`Pipeline`] finds the VM, powers it off after asking the operator,
//! copies its disks over scp, converts them to raw with `qemu-img`, uploads
//! them as images and boots a server from them. Every outside system sits
//! behind a small trait:
//!
//! - [`HypervisorInventory`] lists datastores and finds the VM
//! - [`RemoteExec`] runs commands on the host and copies files off it
//! - [`CloudControl`] runs `openstack` commands and decodes their output
//! - [`command_exec::CommandRunner`] runs the image converter
//! - [`Confirmation`] asks before the power-off
//!
//! Re-running a failed job is safe: each step notices work already done.
//! Two runs against the same VM or working directory at once are not.

pub mod config;
pub mod error;
pub mod inventory;
pub mod job;
pub mod openstack;
pub mod pipeline;
pub mod prompt;
pub mod remote;

#[cfg(test)]
mod fakes;

pub use config::MigrationConfig;
pub use error::MigrationError;
pub use inventory::HypervisorInventory;
pub use job::MigrationJob;
pub use openstack::CloudControl;
pub use pipeline::Pipeline;
pub use prompt::Confirmation;
pub use remote::RemoteExec;
