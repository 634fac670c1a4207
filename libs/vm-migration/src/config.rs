// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration configuration
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! esxi:
//!   host: esxi01.example.com
//!   ssh-port: 22
//!   password: secret
//!   vm: web01
//! openstack:
//!   env:
//!     OS_CLOUD: production
//!   target:
//!     flavor: m1.large
//!     security_group: default
//!     networks:
//!       - lan: auto
//!       - dmz: 192.0.2.10
//! converter:
//!   data_path: /srv/migration
//! ```
//!
//! `VM2CLOUD_DATA_PATH` and `VM2CLOUD_MOUNT_PATH` override the converter
//! paths after the file is read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::MigrationError;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_COMPUTE_API_VERSION: &str = "2.90";

/// Network IP placeholder asking the cloud to pick an address
pub const AUTO_IP: &str = "auto";

#[derive(Clone, Debug, Deserialize)]
pub struct MigrationConfig {
    pub esxi: EsxiConfig,
    pub openstack: OpenStackConfig,
    pub converter: ConverterConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EsxiConfig {
    pub host: String,
    #[serde(rename = "ssh-port", alias = "ssh_port", default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Password for `sshpass`; without it key authentication is used
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Name of the VM to migrate
    pub vm: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OpenStackConfig {
    /// Environment for the `openstack` CLI (`OS_AUTH_URL`, `OS_CLOUD`, ...)
    #[serde(default, deserialize_with = "scalar_map")]
    pub env: BTreeMap<String, String>,
    pub target: TargetConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TargetConfig {
    pub flavor: String,
    pub security_group: String,
    /// Each entry maps one network name to an IP or `auto`
    #[serde(default)]
    pub networks: Vec<BTreeMap<String, String>>,
    #[serde(default = "default_compute_api_version")]
    pub compute_api_version: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConverterConfig {
    pub data_path: PathBuf,
    /// Root below which image volumes are mounted
    #[serde(default)]
    pub mount_path: Option<PathBuf>,
}

/// A network attachment requested by the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    /// `None` for an automatically assigned address
    pub fixed_ip: Option<String>,
}

/// Accept numbers and booleans as environment values, as in
/// `OS_IDENTITY_API_VERSION: 3`.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    use serde_yaml::Value;

    BTreeMap::<String, Value>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "value of {} must be a scalar, got {:?}",
                        key, other
                    )));
                }
            };
            Ok((key, value))
        })
        .collect()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_compute_api_version() -> String {
    DEFAULT_COMPUTE_API_VERSION.to_string()
}

impl MigrationConfig {
    /// Read, override from the environment, and validate.
    pub async fn from_file(path: &Path) -> Result<Self, MigrationError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MigrationError::Config(format!("Could not read configuration {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&content).map_err(|e| match e {
            MigrationError::Config(msg) => {
                MigrationError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, MigrationError> {
        serde_yaml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VM2CLOUD_DATA_PATH") {
            self.converter.data_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("VM2CLOUD_MOUNT_PATH") {
            self.converter.mount_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        let required = [
            ("esxi.host", self.esxi.host.as_str()),
            ("esxi.vm", self.esxi.vm.as_str()),
            ("openstack.target.flavor", self.openstack.target.flavor.as_str()),
            (
                "openstack.target.security_group",
                self.openstack.target.security_group.as_str(),
            ),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(MigrationError::Config(format!("{} must not be empty", key)));
            }
        }

        if self.converter.data_path.as_os_str().is_empty() {
            return Err(MigrationError::Config(
                "converter.data_path must not be empty".to_string(),
            ));
        }

        self.networks().map(|_| ())
    }

    /// Configured networks, in order.
    pub fn networks(&self) -> Result<Vec<NetworkSpec>, MigrationError> {
        self.openstack
            .target
            .networks
            .iter()
            .map(|entry| {
                let mut iter = entry.iter();
                match (iter.next(), iter.next()) {
                    (Some((name, ip)), None) => Ok(NetworkSpec {
                        name: name.clone(),
                        fixed_ip: (ip != AUTO_IP).then(|| ip.clone()),
                    }),
                    _ => Err(MigrationError::Config(format!(
                        "each network entry needs exactly one `name: ip` pair, got {:?}",
                        entry
                    ))),
                }
            })
            .collect()
    }

    /// Working directory for the job called `name`.
    pub fn job_dir(&self, name: &str) -> PathBuf {
        self.converter.data_path.join(name)
    }

    pub fn mount_root(&self) -> PathBuf {
        self.converter
            .mount_path
            .clone()
            .unwrap_or_else(|| self.converter.data_path.join("mnt"))
    }
}
