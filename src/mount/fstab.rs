//! Minimal `/etc/fstab` parsing and block-device lookup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: String,
}

impl FstabEntry {
    /// Entries that are not backed by a real filesystem on the image.
    pub fn is_mountable(&self) -> bool {
        self.mount_point.starts_with('/')
            && !matches!(self.fstype.as_str(), "swap" | "none" | "tmpfs" | "proc" | "sysfs" | "devpts")
    }

    pub fn depth(&self) -> usize {
        Path::new(&self.mount_point)
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .count()
    }
}

/// Parse fstab text, skipping comments and blank lines.
pub fn parse_fstab(text: &str) -> Vec<FstabEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let spec = fields.next()?.to_string();
            let mount_point = fields.next()?.to_string();
            let fstype = fields.next()?.to_string();
            let options = fields.next().unwrap_or("defaults").to_string();
            Some(FstabEntry {
                spec,
                mount_point,
                fstype,
                options,
            })
        })
        .collect()
}

/// One node of `lsblk --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    pub label: Option<String>,
    pub partlabel: Option<String>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// List the partitions of `device`.
pub fn list_partitions(device: &Path) -> Result<Vec<BlockDevice>> {
    let result = Cmd::new("lsblk")
        .args(["--json", "--paths", "--output", "NAME,FSTYPE,UUID,PARTUUID,LABEL,PARTLABEL"])
        .arg_path(device)
        .error_msg(format!("failed to list partitions of ({})", device.display()))
        .run()?;
    parse_lsblk(&result.stdout)
}

pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("failed to parse lsblk output")?;
    Ok(parsed
        .blockdevices
        .into_iter()
        .flat_map(|device| device.children)
        .collect())
}

/// Resolve an fstab `spec` (`UUID=`, `PARTUUID=`, `LABEL=`, `PARTLABEL=` or a
/// device path) to one of `partitions`.
pub fn resolve_spec<'a>(spec: &str, partitions: &'a [BlockDevice]) -> Option<&'a BlockDevice> {
    let eq = |field: &Option<String>, value: &str| {
        field
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(value))
    };

    if let Some(value) = spec.strip_prefix("UUID=") {
        partitions.iter().find(|p| eq(&p.uuid, value))
    } else if let Some(value) = spec.strip_prefix("PARTUUID=") {
        partitions.iter().find(|p| eq(&p.partuuid, value))
    } else if let Some(value) = spec.strip_prefix("LABEL=") {
        partitions.iter().find(|p| p.label.as_deref() == Some(value))
    } else if let Some(value) = spec.strip_prefix("PARTLABEL=") {
        partitions.iter().find(|p| p.partlabel.as_deref() == Some(value))
    } else {
        partitions.iter().find(|p| p.name == spec)
    }
}

/// Render fstab lines for a freshly created two-partition disk.
pub fn render_fstab(root_fs_uuid: &str, efi_fs_uuid: &str, efi_mount: &str) -> String {
    format!(
        "UUID={} / ext4 defaults 0 1\nUUID={} {} vfat umask=0077 0 2\n",
        root_fs_uuid, efi_fs_uuid, efi_mount
    )
}

pub fn mount_target(root: &Path, mount_point: &str) -> PathBuf {
    root.join(mount_point.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK: &str = r#"{
   "blockdevices": [
      {"name":"/dev/loop3", "fstype":null, "uuid":null, "partuuid":null, "label":null, "partlabel":null,
         "children": [
            {"name":"/dev/loop3p1", "fstype":"vfat", "uuid":"ABCD-1234", "partuuid":"11111111-01", "label":"EFI", "partlabel":"esp"},
            {"name":"/dev/loop3p2", "fstype":"ext4", "uuid":"6f1c0d8e-aaaa-bbbb-cccc-0123456789ab", "partuuid":"22222222-02", "label":"root", "partlabel":"rootfs"}
         ]
      }
   ]
}"#;

    #[test]
    fn parses_fstab_entries() {
        let text = "# comment\n\nUUID=abc / ext4 defaults 0 1\nUUID=efi /boot/efi vfat umask=0077 0 2\n/dev/sda3 none swap sw 0 0\n";
        let entries = parse_fstab(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].mount_point, "/boot/efi");
        assert_eq!(entries[1].options, "umask=0077");
        assert!(entries[1].is_mountable());
        assert!(!entries[2].is_mountable());
        assert_eq!(entries[1].depth(), 2);
        assert_eq!(entries[0].depth(), 0);
    }

    #[test]
    fn parses_lsblk_children() {
        let partitions = parse_lsblk(LSBLK).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].fstype.as_deref(), Some("ext4"));
    }

    #[test]
    fn resolves_every_spec_form() {
        let partitions = parse_lsblk(LSBLK).unwrap();
        let name = |spec: &str| resolve_spec(spec, &partitions).map(|p| p.name.clone());

        assert_eq!(name("UUID=abcd-1234").as_deref(), Some("/dev/loop3p1"));
        assert_eq!(name("PARTUUID=22222222-02").as_deref(), Some("/dev/loop3p2"));
        assert_eq!(name("LABEL=root").as_deref(), Some("/dev/loop3p2"));
        assert_eq!(name("PARTLABEL=esp").as_deref(), Some("/dev/loop3p1"));
        assert_eq!(name("/dev/loop3p2").as_deref(), Some("/dev/loop3p2"));
        assert_eq!(name("UUID=missing"), None);
    }

    #[test]
    fn rendered_fstab_round_trips() {
        let text = render_fstab("root-uuid", "ABCD-1234", "/boot/efi");
        let entries = parse_fstab(&text);
        assert_eq!(entries[0].spec, "UUID=root-uuid");
        assert_eq!(entries[1].mount_point, "/boot/efi");
        assert_eq!(entries[1].fstype, "vfat");
    }

    #[test]
    fn mount_target_is_under_root() {
        assert_eq!(
            mount_target(Path::new("/mnt/root"), "/boot/efi"),
            PathBuf::from("/mnt/root/boot/efi")
        );
    }
}
