// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Error types for the migration pipeline

use command_exec::ExecutionError;
use thiserror::Error;

/// Process exit status for a generic fatal error.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit status when the operator declines the power-off.
pub const EXIT_DECLINED: i32 = 2;
/// Process exit status when the hypervisor refuses the power-off.
pub const EXIT_POWER_OFF_FAILED: i32 = 3;

/// Errors that abort a migration run
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A configured or discovered resource does not exist
    #[error("Could not resolve {kind} {name}")]
    Resolution { kind: &'static str, name: String },

    /// Remote shell or file transfer failed
    #[error("Could not connect to {host}: {reason}")]
    Connectivity { host: String, reason: String },

    /// An external tool failed or produced no usable output
    #[error("{tool} failed: {stderr}")]
    ExternalTool { tool: String, stderr: String },

    /// Local filesystem error
    #[error("{context}: {err}")]
    Io {
        context: String,
        #[source]
        err: std::io::Error,
    },

    /// Configuration file missing, unreadable or invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The operator did not confirm the power-off
    #[error("Power-off of VM {vm} was not confirmed")]
    ConfirmationDeclined { vm: String },

    /// The hypervisor returned a non-zero status for the power-off
    #[error("Powering off VM {vm} failed with status {code:?}: {stderr}")]
    PowerOffFailed {
        vm: String,
        code: Option<i32>,
        stderr: String,
    },

    /// There is nothing to boot a server from
    #[error("Cannot create server: no images to use")]
    NoArtifacts,

    /// A previously imported image does not report its size
    #[error("Image {name} is already imported as {id} but its size is unavailable")]
    ImageSizeUnavailable { name: String, id: String },
}

impl MigrationError {
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        MigrationError::Io {
            context: context.into(),
            err,
        }
    }

    pub fn resolution(kind: &'static str, name: impl Into<String>) -> Self {
        MigrationError::Resolution {
            kind,
            name: name.into(),
        }
    }

    /// The process exit status this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::ConfirmationDeclined { .. } => EXIT_DECLINED,
            MigrationError::PowerOffFailed { .. } => EXIT_POWER_OFF_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<ExecutionError> for MigrationError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::ExecutionStart { command, err } => MigrationError::ExternalTool {
                tool: command,
                stderr: err.to_string(),
            },
            ExecutionError::CommandFailure(info) => MigrationError::ExternalTool {
                tool: info.command().to_string(),
                stderr: info.stderr.trim().to_string(),
            },
            other => MigrationError::ExternalTool {
                tool: "command".to_string(),
                stderr: other.to_string(),
            },
        }
    }
}
