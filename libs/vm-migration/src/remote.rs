// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Remote shell and file copy against the hypervisor host
//!
//! [`SshRemote`] drives the system `ssh` and `scp` binaries. All of them
//! share one ControlMaster connection, opened by
//! [`RemoteExec::open_session`] and closed when the returned
//! [`SessionGuard`] is dropped.
//!
//! Copies use the legacy scp protocol so the remote shell expands the
//! file glob. OpenSSH 9.0 and later need `scp -O` for that; older clients
//! speak it by default and reject the flag, so the local client version is
//! checked before each copy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use command_exec::CommandOutput;
use regex::Regex;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;

use crate::config::EsxiConfig;
use crate::error::MigrationError;

/// Time between two progress reports while a copy runs.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// ssh exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Progress callback: `(file name, total bytes, bytes received)`.
pub type ProgressFn<'a> = dyn Fn(&str, u64, u64) + Send + Sync + 'a;

static OPENSSH_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // constant pattern
    Regex::new(r"OpenSSH_(\d+)\.\d+").unwrap()
});

/// Releases a remote session when dropped.
pub struct SessionGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SessionGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

// The release closure runs synchronously, on whatever thread drops the
// guard. For ssh that is one short `ssh -O exit` at the end of a run.
impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Open the authenticated session later calls reuse.
    async fn open_session(&self) -> Result<SessionGuard, MigrationError>;

    /// Run a shell command on the remote host.
    ///
    /// A non-zero exit status of `command` is returned in the output, not
    /// as an error; failing to reach the host is an error.
    async fn run(&self, command: &str) -> Result<CommandOutput, MigrationError>;

    /// Copy every file in `remote_dir` whose name matches `pattern` (a
    /// `*suffix` glob) into `local_dir`.
    ///
    /// `progress` is called for partially received files once per
    /// [`PROGRESS_INTERVAL`], and once more for each file when the copy
    /// completes.
    async fn copy_files_matching(
        &self,
        remote_dir: &str,
        pattern: &str,
        local_dir: &Path,
        progress: &ProgressFn<'_>,
    ) -> Result<(), MigrationError>;
}

/// Drive `work` to completion, running `sample` every `interval` until
/// it finishes.
async fn sample_while<W, S, F>(work: W, interval: Duration, mut sample: S) -> W::Output
where
    W: Future,
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    tokio::pin!(work);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => sample().await,
        }
    }
}

/// Whether the scp shipped with the ssh reporting `banner` (the output of
/// `ssh -V`) needs `-O` to use the legacy protocol.
fn scp_needs_legacy_flag(banner: &str) -> bool {
    OPENSSH_VERSION
        .captures(banner)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .is_none_or(|major| major >= 9)
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Match a file name against `*suffix`, `prefix*` or an exact name.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name == pattern,
    }
}

/// Parse `ls -ln` into `(name, size)` for regular files.
pub fn parse_ls(stdout: &str) -> Vec<(String, u64)> {
    stdout
        .lines()
        .filter(|line| line.starts_with('-'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 9 {
                return None;
            }
            let size = fields[4].parse().ok()?;
            Some((fields[8..].join(" "), size))
        })
        .collect()
}

/// Remote access over the system OpenSSH client.
pub struct SshRemote {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    identity_file: Option<PathBuf>,
    control_path: PathBuf,
}

impl SshRemote {
    pub fn new(config: &EsxiConfig) -> Self {
        // ssh expands %C to a hash of the connection parameters, which
        // keeps the socket path short and unique per host.
        let control_path = std::env::temp_dir().join("vm2cloud-%C");
        Self {
            host: config.host.clone(),
            port: config.ssh_port,
            user: config.user.clone(),
            password: config.password.clone(),
            identity_file: config.identity_file.clone(),
            control_path,
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn connectivity(&self, reason: impl Into<String>) -> MigrationError {
        MigrationError::Connectivity {
            host: self.host.clone(),
            reason: reason.into(),
        }
    }

    /// `tool` wrapped in `sshpass` when a password is configured.
    fn command(&self, tool: &str) -> Command {
        let mut cmd = match &self.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(tool).env("SSHPASS", password);
                cmd
            }
            None => Command::new(tool),
        };
        cmd.stdin(Stdio::null());
        cmd.args(self.common_options());
        cmd
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ];
        if let Some(identity) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        if self.password.is_none() {
            opts.push("-o".to_string());
            opts.push("BatchMode=yes".to_string());
        }
        opts
    }

    /// Arguments selecting the legacy scp protocol for the local client.
    async fn legacy_scp_args(&self) -> Vec<&'static str> {
        // ssh -V prints its banner on stderr.
        let banner = match Command::new("ssh").arg("-V").stdin(Stdio::null()).output().await {
            Ok(output) => String::from_utf8_lossy(&output.stderr).into_owned(),
            Err(e) => {
                tracing::debug!(error = %e, "Could not read ssh version");
                String::new()
            }
        };
        if scp_needs_legacy_flag(&banner) {
            vec!["-O"]
        } else {
            tracing::debug!(version = %banner.trim(), "scp uses the legacy protocol by default");
            Vec::new()
        }
    }

    pub async fn list_files(
        &self,
        remote_dir: &str,
        pattern: &str,
    ) -> Result<Vec<(String, u64)>, MigrationError> {
        let output = self.run(&format!("ls -ln {}", shell_quote(remote_dir))).await?;
        if !output.success() {
            return Err(MigrationError::resolution("remote directory", remote_dir));
        }
        Ok(parse_ls(&output.stdout)
            .into_iter()
            .filter(|(name, _)| glob_matches(pattern, name))
            .collect())
    }
}

async fn report_copy_progress(
    files: &[(String, u64)],
    local_dir: &Path,
    progress: &ProgressFn<'_>,
) {
    for (name, total) in files {
        let sent = tokio::fs::metadata(local_dir.join(name))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if sent > 0 && sent < *total {
            progress(name, *total, sent);
        }
    }
}

#[async_trait]
impl RemoteExec for SshRemote {
    async fn open_session(&self) -> Result<SessionGuard, MigrationError> {
        let output = self
            .command("ssh")
            .args(["-M", "-f", "-N", "-o", "ControlPersist=yes", "-p"])
            .arg(self.port.to_string())
            .arg(self.target())
            .output()
            .await
            .map_err(|e| self.connectivity(format!("could not start ssh: {}", e)))?;

        if !output.status.success() {
            return Err(self.connectivity(String::from_utf8_lossy(&output.stderr).trim()));
        }

        tracing::debug!(host = %self.host, "Opened ssh control connection");

        let control_path = self.control_path.clone();
        let target = self.target();
        let port = self.port.to_string();
        Ok(SessionGuard::new(move || {
            let result = std::process::Command::new("ssh")
                .arg("-o")
                .arg(format!("ControlPath={}", control_path.display()))
                .args(["-O", "exit", "-p", &port, &target])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match result {
                Ok(status) if status.success() => {
                    tracing::debug!(target = %target, "Closed ssh control connection");
                }
                Ok(status) => {
                    tracing::warn!(target = %target, %status, "Closing ssh control connection failed");
                }
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "Could not run ssh to close control connection");
                }
            }
        }))
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, MigrationError> {
        tracing::debug!(host = %self.host, command = %command, "Remote command");

        let output = self
            .command("ssh")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(self.target())
            .arg(command)
            .output()
            .await
            .map_err(|e| self.connectivity(format!("could not start ssh: {}", e)))?;

        let output = CommandOutput::from(output);
        if output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(self.connectivity(output.stderr.trim()));
        }
        Ok(output)
    }

    async fn copy_files_matching(
        &self,
        remote_dir: &str,
        pattern: &str,
        local_dir: &Path,
        progress: &ProgressFn<'_>,
    ) -> Result<(), MigrationError> {
        let files = self.list_files(remote_dir, pattern).await?;
        if files.is_empty() {
            return Err(MigrationError::resolution(
                "disk files",
                format!("{}/{}", remote_dir, pattern),
            ));
        }

        // Legacy scp protocol: the remote shell expands the glob.
        let source = format!("{}:{}/{}", self.target(), shell_quote(remote_dir), pattern);
        let legacy = self.legacy_scp_args().await;
        let child = self
            .command("scp")
            .args(legacy)
            .arg("-P")
            .arg(self.port.to_string())
            .arg(&source)
            .arg(local_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.connectivity(format!("could not start scp: {}", e)))?;

        let listed = files.as_slice();
        let output = sample_while(child.wait_with_output(), PROGRESS_INTERVAL, move || {
            report_copy_progress(listed, local_dir, progress)
        })
        .await
        .map_err(|e| self.connectivity(format!("scp failed: {}", e)))?;

        if !output.status.success() {
            return Err(self.connectivity(String::from_utf8_lossy(&output.stderr).trim()));
        }

        for (name, total) in &files {
            progress(name, *total, *total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use test_case::test_case;

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval_while_work_runs() {
        let samples = AtomicUsize::new(0);
        let work = async {
            tokio::time::sleep(Duration::from_secs(45)).await;
            "done"
        };

        let output = sample_while(work, PROGRESS_INTERVAL, || {
            samples.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;

        assert_eq!(output, "done");
        // 10, 20, 30 and 40 seconds in; no tick is skipped.
        assert_eq!(samples.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn short_work_is_never_sampled() {
        let samples = AtomicUsize::new(0);
        sample_while(
            tokio::time::sleep(Duration::from_secs(9)),
            PROGRESS_INTERVAL,
            || {
                samples.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;
        assert_eq!(samples.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reports_only_partially_received_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-disc1.vmdk"), b"12345").unwrap();
        std::fs::write(dir.path().join("a-disc2.vmdk"), b"1234567890").unwrap();
        let files = vec![
            ("a-disc1.vmdk".to_string(), 10),
            ("a-disc2.vmdk".to_string(), 10),
            ("a-disc3.vmdk".to_string(), 10),
        ];

        let seen = Mutex::new(Vec::new());
        let progress = |name: &str, total: u64, sent: u64| {
            seen.lock().unwrap().push((name.to_string(), total, sent));
        };
        report_copy_progress(&files, dir.path(), &progress).await;

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![("a-disc1.vmdk".to_string(), 10, 5)]
        );
    }

    #[test_case("OpenSSH_9.6p1 Ubuntu-3ubuntu13.5, OpenSSL 3.0.13 30 Jan 2024", true ; "openssh 9")]
    #[test_case("OpenSSH_10.0p2, OpenSSL 3.5.0 8 Apr 2025", true ; "openssh 10")]
    #[test_case("OpenSSH_8.9p1 Ubuntu-3ubuntu0.10, OpenSSL 3.0.2 15 Mar 2022", false ; "openssh 8")]
    #[test_case("OpenSSH_7.4p1, OpenSSL 1.0.2k-fips  26 Jan 2017", false ; "openssh 7")]
    #[test_case("", true ; "unknown client")]
    fn legacy_scp_flag_follows_client_version(banner: &str, expected: bool) {
        assert_eq!(scp_needs_legacy_flag(banner), expected);
    }

    #[test]
    fn session_guard_releases_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        {
            let _guard = SessionGuard::new(move || flag.store(true, Ordering::SeqCst));
            assert!(!released.load(Ordering::SeqCst));
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test_case("/vmfs/volumes/ds1/web01", "'/vmfs/volumes/ds1/web01'" ; "plain")]
    #[test_case("/vmfs/volumes/my ds/web01", "'/vmfs/volumes/my ds/web01'" ; "space")]
    #[test_case("it's", r"'it'\''s'" ; "quote")]
    fn quoting(input: &str, expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test_case("*.vmdk", "web01-disc1.vmdk", true ; "suffix")]
    #[test_case("*.vmdk", "web01.vmx", false ; "wrong suffix")]
    #[test_case("web01*", "web01.vmx", true ; "prefix")]
    #[test_case("web01.vmx", "web01.vmx", true ; "exact")]
    fn globbing(pattern: &str, name: &str, expected: bool) {
        assert_eq!(glob_matches(pattern, name), expected);
    }

    #[test]
    fn parses_ls_listing() {
        let stdout = "total 8388736\n\
            drwxr-xr-x    1 0        0              4 Jan  3 10:00 .sdd.sf\n\
            -rw-------    1 0        0     8589934592 Jan  3 10:00 web01-disc1-flat.vmdk\n\
            -rw-------    1 0        0            512 Jan  3 10:00 web01-disc1.vmdk\n\
            -rw-r--r--    1 0        0            263 Jan  3 10:00 my disk.vmdk\n";
        assert_eq!(
            parse_ls(stdout),
            vec![
                ("web01-disc1-flat.vmdk".to_string(), 8589934592),
                ("web01-disc1.vmdk".to_string(), 512),
                ("my disk.vmdk".to_string(), 263),
            ]
        );
    }

    #[test]
    fn ssh_options_depend_on_auth() {
        let mut config = crate::fakes::config().esxi;
        config.password = None;
        config.identity_file = Some(PathBuf::from("/root/.ssh/id_ed25519"));
        let remote = SshRemote::new(&config);
        let opts = remote.common_options();
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"/root/.ssh/id_ed25519".to_string()));

        config.password = Some("secret".into());
        let remote = SshRemote::new(&config);
        assert!(!remote.common_options().contains(&"BatchMode=yes".to_string()));
    }
}
