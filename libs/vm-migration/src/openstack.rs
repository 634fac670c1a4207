// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! OpenStack control plane, driven through the `openstack` CLI
//!
//! [`CloudControl`] only runs a command and decodes its YAML output. The
//! functions in this module give that output meaning, one field at a time,
//! so a different client only needs to produce the same shapes.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use command_exec::{CommandRunner, LocalRunner};
use serde_yaml::Value;

use crate::error::MigrationError;

const OPENSTACK: &str = "openstack";

/// Properties every imported image carries so the instance boots from a
/// virtio SCSI disk with a watchdog.
pub const IMAGE_PROPERTIES: &[&str] = &[
    "hw_disk_bus=scsi",
    "hw_scsi_model=virtio-scsi",
    "hw_watchdog_action=reset",
];

/// The result of one control plane command.
#[derive(Debug, Clone)]
pub struct CloudOutput {
    /// Decoded stdout, `Null` when there was nothing to decode
    pub parsed: Value,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CloudOutput {
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        Self {
            parsed: decode(&stdout),
            stdout,
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            parsed: Value::Null,
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

#[async_trait]
pub trait CloudControl: Send + Sync {
    /// Run one command, e.g. `["image", "list"]`.
    ///
    /// A command that ran and failed is returned with `success == false`;
    /// only failing to run it at all is an error.
    async fn execute(&self, argv: &[String]) -> Result<CloudOutput, MigrationError>;
}

fn decode(stdout: &str) -> Value {
    if stdout.trim().is_empty() {
        return Value::Null;
    }
    serde_yaml::from_str(stdout).unwrap_or(Value::Null)
}

/// The `openstack` command line client.
pub struct OpenStackCli {
    runner: LocalRunner,
}

impl OpenStackCli {
    /// `env` is added to the inherited environment of every command.
    pub fn new(env: &BTreeMap<String, String>) -> Self {
        Self {
            runner: LocalRunner::new().with_envs(env.clone()),
        }
    }
}

#[async_trait]
impl CloudControl for OpenStackCli {
    async fn execute(&self, argv: &[String]) -> Result<CloudOutput, MigrationError> {
        let mut full = vec![OPENSTACK];
        full.extend(argv.iter().map(String::as_str));
        full.extend(["-f", "yaml"]);

        let output = self.runner.output(&full).await?;
        Ok(CloudOutput {
            parsed: decode(&output.stdout),
            success: output.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// An image as listed by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
}

fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| value.get(*name))
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    field(value, names).and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

/// The `id` of a shown or created resource.
pub fn resource_id(value: &Value) -> Option<String> {
    string_field(value, &["id", "ID"])
}

/// Image size in bytes, from a listing row or `image show`.
pub fn image_size(value: &Value) -> Option<u64> {
    field(value, &["size", "Size"]).and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn image_list(value: &Value) -> Vec<ImageSummary> {
    let Some(rows) = value.as_sequence() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            Some(ImageSummary {
                id: string_field(row, &["ID", "id"])?,
                name: string_field(row, &["Name", "name"])?,
                size: image_size(row),
            })
        })
        .collect()
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn tool_error(argv: &[String], output: &CloudOutput) -> MigrationError {
    let stderr = output.stderr.trim();
    MigrationError::ExternalTool {
        tool: format!("{} {}", OPENSTACK, argv.join(" ")),
        stderr: if stderr.is_empty() {
            "no usable output".to_string()
        } else {
            stderr.to_string()
        },
    }
}

async fn show_id(
    cloud: &dyn CloudControl,
    kind: &'static str,
    argv: Vec<String>,
    name: &str,
) -> Result<String, MigrationError> {
    let output = cloud.execute(&argv).await?;
    if !output.success {
        tracing::error!(kind, name, stderr = %output.stderr.trim(), "Lookup failed");
        return Err(MigrationError::resolution(kind, name));
    }
    resource_id(&output.parsed).ok_or_else(|| MigrationError::resolution(kind, name))
}

pub async fn network_id(cloud: &dyn CloudControl, name: &str) -> Result<String, MigrationError> {
    show_id(cloud, "network", args(&["network", "show", name]), name).await
}

pub async fn security_group_id(
    cloud: &dyn CloudControl,
    name: &str,
) -> Result<String, MigrationError> {
    show_id(
        cloud,
        "security group",
        args(&["security", "group", "show", name]),
        name,
    )
    .await
}

/// Every image visible to the project, with sizes.
pub async fn list_images(cloud: &dyn CloudControl) -> Result<Vec<ImageSummary>, MigrationError> {
    let argv = args(&["image", "list", "--long"]);
    let output = cloud.execute(&argv).await?;
    if !output.success {
        return Err(tool_error(&argv, &output));
    }
    Ok(image_list(&output.parsed))
}

/// Upload `file` as a private raw image named `name`.
pub async fn create_image(
    cloud: &dyn CloudControl,
    name: &str,
    file: &Path,
) -> Result<String, MigrationError> {
    let mut argv = args(&["image", "create"]);
    for property in IMAGE_PROPERTIES {
        argv.push("--property".to_string());
        argv.push(property.to_string());
    }
    argv.extend(args(&["--disk-format", "raw", "--private", "--file"]));
    argv.push(file.display().to_string());
    argv.push(name.to_string());

    let output = cloud.execute(&argv).await?;
    if !output.success {
        return Err(tool_error(&argv, &output));
    }
    resource_id(&output.parsed).ok_or_else(|| tool_error(&argv, &output))
}

/// The id of server `name`, if it already exists.
pub async fn find_server(
    cloud: &dyn CloudControl,
    name: &str,
) -> Result<Option<String>, MigrationError> {
    let argv = args(&["server", "show", name]);
    let output = cloud.execute(&argv).await?;
    if output.success {
        return Ok(resource_id(&output.parsed));
    }
    if output.stderr.contains("No server with a name or ID") {
        return Ok(None);
    }
    Err(tool_error(&argv, &output))
}

/// An extra volume created from an image when the server boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub image_id: String,
    pub size_gib: u64,
}

/// Everything needed for one `server create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub name: String,
    pub flavor: String,
    pub boot_image_id: String,
    pub boot_size_gib: u64,
    pub security_group_id: String,
    /// `(network id, fixed IPv4)` pairs
    pub nics: Vec<(String, Option<String>)>,
    pub block_devices: Vec<BlockDevice>,
    pub compute_api_version: String,
}

impl ServerRequest {
    pub fn to_args(&self) -> Vec<String> {
        let mut argv = args(&["--os-compute-api-version"]);
        argv.push(self.compute_api_version.clone());
        argv.extend(args(&["server", "create", "--flavor"]));
        argv.push(self.flavor.clone());
        argv.push("--image".to_string());
        argv.push(self.boot_image_id.clone());
        argv.push("--boot-from-volume".to_string());
        argv.push(self.boot_size_gib.to_string());
        argv.push("--security-group".to_string());
        argv.push(self.security_group_id.clone());

        for (net_id, fixed_ip) in &self.nics {
            argv.push("--nic".to_string());
            argv.push(match fixed_ip {
                Some(ip) => format!("net-id={},v4-fixed-ip={}", net_id, ip),
                None => format!("net-id={}", net_id),
            });
        }

        for device in &self.block_devices {
            argv.push("--block-device".to_string());
            argv.push(format!(
                "uuid={},source_type=image,destination_type=volume,volume_size={}",
                device.image_id, device.size_gib
            ));
        }

        argv.push(self.name.clone());
        argv
    }
}

pub async fn create_server(
    cloud: &dyn CloudControl,
    request: &ServerRequest,
) -> Result<String, MigrationError> {
    let argv = request.to_args();
    let output = cloud.execute(&argv).await?;
    if !output.success {
        return Err(tool_error(&argv, &output));
    }
    resource_id(&output.parsed).ok_or_else(|| tool_error(&argv, &output))
}
