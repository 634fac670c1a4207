// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! LVM naming rules and parsers for `vgscan` / `lvscan` output.

use std::sync::LazyLock;

use regex::Regex;

pub const VGSCAN: &str = "vgscan";
pub const VGCHANGE: &str = "vgchange";
pub const VGRENAME: &str = "vgrename";
pub const LVSCAN: &str = "lvscan";

static VOLUME_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // constant pattern
    Regex::new(r#"(?i)volume group "([^"]+)""#).unwrap()
});

/// Device filter that accepts partitions of `loop_device` and rejects
/// every other block device on the host.
pub fn scan_filter(loop_device: &str) -> String {
    format!(
        r#"devices{{filter=["a|^{}[^0-9].*$|","r|.*|"]}}"#,
        loop_device
    )
}

/// `/dev/loop3` becomes `_dev_loop3`.
pub fn vg_suffix(loop_device: &str) -> String {
    loop_device.replace('/', "_")
}

pub fn renamed(volume_group: &str, suffix: &str) -> String {
    format!("{}{}", volume_group, suffix)
}

/// The name a renamed volume group had before, or `None` if `volume_group`
/// does not carry `suffix`.
pub fn original_name<'a>(volume_group: &'a str, suffix: &str) -> Option<&'a str> {
    volume_group
        .strip_suffix(suffix)
        .filter(|original| !original.is_empty())
}

/// Volume group names from `vgscan`, in the order reported.
pub fn parse_vgscan(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| VOLUME_GROUP.captures(line))
        .map(|c| c[1].to_string())
        .collect()
}

/// Device paths of the `ACTIVE` logical volumes listed by `lvscan`.
pub fn parse_lvscan(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.contains("ACTIVE"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|path| path.trim_matches('\'').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("vg0_dev_loop3", "_dev_loop3", Some("vg0") ; "renamed")]
    #[test_case("vg0", "_dev_loop3", None ; "not renamed")]
    #[test_case("vg0_dev_loop30", "_dev_loop3", None ; "other loop device")]
    #[test_case("_dev_loop3", "_dev_loop3", None ; "suffix only")]
    fn original_names(vg: &str, suffix: &str, expected: Option<&str>) {
        assert_eq!(original_name(vg, suffix), expected);
    }

    #[test]
    fn rename_round_trip() {
        let suffix = vg_suffix("/dev/loop3");
        let name = renamed("vg0", &suffix);
        assert_eq!(name, "vg0_dev_loop3");
        assert_eq!(original_name(&name, &suffix), Some("vg0"));
    }

    #[test_case("  Found volume group \"vg0\" using metadata type lvm2\n", vec!["vg0"] ; "single")]
    #[test_case(
        "  Reading all physical volumes.  This may take a while...\n  Found volume group \"centos\" using metadata type lvm2\n",
        vec!["centos"] ;
        "with preamble"
    )]
    #[test_case(
        "  Found volume group \"a\" using metadata type lvm2\n  Found volume group \"b\" using metadata type lvm2\n",
        vec!["a", "b"] ;
        "multiple"
    )]
    #[test_case("", vec![] ; "none")]
    fn vgscan_output(stdout: &str, expected: Vec<&str>) {
        assert_eq!(parse_vgscan(stdout), expected);
    }

    #[test]
    fn lvscan_keeps_active_volumes() {
        let stdout = "  ACTIVE            '/dev/vg0_dev_loop3/root' [<17.00 GiB] inherit\n  \
                      inactive          '/dev/vg0_dev_loop3/swap' [2.00 GiB] inherit\n  \
                      ACTIVE            '/dev/vg0_dev_loop3/var' [4.00 GiB] inherit\n";
        assert_eq!(
            parse_lvscan(stdout),
            vec!["/dev/vg0_dev_loop3/root", "/dev/vg0_dev_loop3/var"]
        );
    }
}
