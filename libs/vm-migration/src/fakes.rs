// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory collaborators for exercising the pipeline without a
//! hypervisor, a cloud or root.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use command_exec::{CommandOutput, CommandRunner, ExecutionError, command_to_string};

use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::inventory::{HostInfo, HypervisorInventory, VmInfo};
use crate::openstack::{CloudControl, CloudOutput};
use crate::remote::{ProgressFn, RemoteExec, SessionGuard};

pub const CONFIG: &str = r#"
esxi:
  host: esxi01.example.com
  password: secret
  vm: web01
openstack:
  env:
    OS_CLOUD: production
  target:
    flavor: m1.large
    security_group: default
    networks:
      - lan: auto
      - dmz: 192.0.2.10
converter:
  data_path: /srv/migration
"#;

pub fn config() -> MigrationConfig {
    MigrationConfig::from_yaml(CONFIG).unwrap()
}

/// Scripted answers keyed by command prefix, first match wins.
struct Script<T> {
    responders: Vec<(String, T, bool)>,
    calls: Vec<String>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            responders: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn answer(&mut self, command: &str) -> Option<T> {
        self.calls.push(command.to_string());
        let idx = self
            .responders
            .iter()
            .position(|(prefix, _, _)| command.starts_with(prefix.as_str()))?;
        let (_, output, once) = &self.responders[idx];
        let output = output.clone();
        if *once {
            self.responders.remove(idx);
        }
        Some(output)
    }
}

#[derive(Default)]
pub struct FakeInventory {
    pub hosts: Vec<HostInfo>,
    pub vms: Vec<VmInfo>,
}

#[async_trait]
impl HypervisorInventory for FakeInventory {
    async fn list_hosts(&self) -> Result<Vec<HostInfo>, MigrationError> {
        Ok(self.hosts.clone())
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>, MigrationError> {
        Ok(self.vms.iter().find(|vm| vm.name == name).cloned())
    }
}

/// Remote host whose commands succeed with empty output unless scripted,
/// and whose copies drop `files` into the local directory.
pub struct FakeRemote {
    script: Mutex<Script<CommandOutput>>,
    copies: Mutex<Vec<String>>,
    files: Mutex<Vec<(String, Vec<u8>)>>,
    pub sessions_opened: Arc<AtomicUsize>,
    pub sessions_released: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
            copies: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            sessions_released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.script
            .lock()
            .unwrap()
            .responders
            .push((prefix.to_string(), output, false));
    }

    pub fn respond_once(&self, prefix: &str, output: CommandOutput) {
        self.script
            .lock()
            .unwrap()
            .responders
            .push((prefix.to_string(), output, true));
    }

    /// A file that a copy will write locally.
    pub fn serve_file(&self, name: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .push((name.to_string(), content.to_vec()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// `remote_dir/pattern` of each copy requested.
    pub fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn open_session(&self) -> Result<SessionGuard, MigrationError> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let released = self.sessions_released.clone();
        Ok(SessionGuard::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, MigrationError> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .answer(command)
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    async fn copy_files_matching(
        &self,
        remote_dir: &str,
        pattern: &str,
        local_dir: &Path,
        progress: &ProgressFn<'_>,
    ) -> Result<(), MigrationError> {
        self.copies
            .lock()
            .unwrap()
            .push(format!("{}/{}", remote_dir, pattern));
        let files = self.files.lock().unwrap().clone();
        for (name, content) in files {
            std::fs::write(local_dir.join(&name), &content).unwrap();
            progress(&name, content.len() as u64, content.len() as u64);
        }
        Ok(())
    }
}

/// Cloud whose commands succeed with no output unless scripted.
pub struct FakeCloud {
    script: Mutex<Script<CloudOutput>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::new()),
        }
    }

    pub fn respond(&self, prefix: &str, output: CloudOutput) {
        self.script
            .lock()
            .unwrap()
            .responders
            .push((prefix.to_string(), output, false));
    }

    pub fn respond_once(&self, prefix: &str, output: CloudOutput) {
        self.script
            .lock()
            .unwrap()
            .responders
            .push((prefix.to_string(), output, true));
    }

    /// Every command issued, arguments joined by spaces.
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl CloudControl for FakeCloud {
    async fn execute(&self, argv: &[String]) -> Result<CloudOutput, MigrationError> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .answer(&argv.join(" "))
            .unwrap_or_else(|| CloudOutput::from_stdout("")))
    }
}

#[derive(Default)]
enum Conversion {
    #[default]
    Succeed,
    /// Exits non-zero after writing part of its output
    Fail(CommandOutput),
    /// The binary is not installed
    Missing,
}

/// Image converter that writes its output file, the last argument.
#[derive(Default)]
pub struct FakeConverter {
    calls: Mutex<Vec<String>>,
    conversion: Conversion,
}

impl FakeConverter {
    pub fn failing(code: i32, stderr: &str) -> Self {
        Self {
            conversion: Conversion::Fail(CommandOutput::failed(code, stderr)),
            ..Default::default()
        }
    }

    pub fn missing() -> Self {
        Self {
            conversion: Conversion::Missing,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeConverter {
    async fn output(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError> {
        self.calls.lock().unwrap().push(command_to_string(argv));
        match &self.conversion {
            Conversion::Missing => Err(ExecutionError::ExecutionStart {
                command: command_to_string(argv),
                err: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            Conversion::Fail(output) => {
                if let Some(target) = argv.last() {
                    std::fs::write(target, b"ra").unwrap();
                }
                Ok(output.clone())
            }
            Conversion::Succeed => {
                if let Some(target) = argv.last() {
                    std::fs::write(target, b"raw").unwrap();
                }
                Ok(CommandOutput::ok(""))
            }
        }
    }
}
