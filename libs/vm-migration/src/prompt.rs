// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use dialoguer::Confirm;

use crate::error::MigrationError;
use crate::job::SourceVm;

const BOLD_RED: &str = "\x1b[1;31m";
const RESET: &str = "\x1b[0m";

/// Asks the operator before anything destructive happens.
pub trait Confirmation: Send + Sync {
    fn confirm_power_off(&self, vm: &SourceVm) -> Result<bool, MigrationError>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalConfirmation;

pub fn power_off_warning(vm: &SourceVm) -> String {
    format!(
        "{}WARNING: VM {} (id {}) is about to be powered off.{}",
        BOLD_RED, vm.name, vm.id, RESET
    )
}

impl Confirmation for TerminalConfirmation {
    fn confirm_power_off(&self, vm: &SourceVm) -> Result<bool, MigrationError> {
        eprintln!("{}", power_off_warning(vm));
        Confirm::new()
            .with_prompt("Continue?")
            .default(false)
            .interact()
            .map_err(|e| {
                MigrationError::io(
                    "Could not read confirmation",
                    std::io::Error::other(e.to_string()),
                )
            })
    }
}

/// Answers every prompt the same way, for `--yes` style runs.
#[derive(Debug)]
pub struct FixedConfirmation(pub bool);

impl Confirmation for FixedConfirmation {
    fn confirm_power_off(&self, vm: &SourceVm) -> Result<bool, MigrationError> {
        tracing::info!(vm = %vm.name, answer = self.0, "Power-off confirmation answered without prompting");
        Ok(self.0)
    }
}
