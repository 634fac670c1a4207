// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The live system mount table.

use std::path::{Path, PathBuf};

pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";
pub const MKDIR: &str = "mkdir";

/// Command line listing the mount table as `SOURCE TARGET` pairs.
pub const FINDMNT: [&str; 6] = [
    "findmnt",
    "--list",
    "--raw",
    "--noheadings",
    "--output",
    "SOURCE,TARGET",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
}

/// Parse `findmnt --raw` output. Raw mode hex-escapes whitespace, so
/// every line has exactly two fields.
pub fn parse_findmnt(stdout: &str) -> Vec<MountEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: unescape(target),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(idx) = rest.find("\\x") {
        out.push_str(&rest[..idx]);
        let hex = rest.get(idx + 2..idx + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[idx + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[idx + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether a mount source lives in a volume group renamed with `suffix`.
///
/// The suffix must end the volume group name: device-mapper sources look
/// like `/dev/mapper/vg0_dev_loop3-root`, LVM paths like
/// `/dev/vg0_dev_loop3/root`. `_dev_loop3` does not match `_dev_loop30`.
pub fn source_has_suffix(source: &str, suffix: &str) -> bool {
    source.match_indices(suffix).any(|(idx, _)| {
        matches!(
            source[idx + suffix.len()..].chars().next(),
            Some('-') | Some('/')
        )
    })
}

/// Mount point for a logical volume: the device path below `mount_root`.
pub fn mount_point(mount_root: &Path, device: &str) -> PathBuf {
    mount_root.join(device.trim_start_matches('/'))
}
