//! UUID generation and size estimation for writeable disk images.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::layout::EXPANSION_SAFETY_FACTOR;
use crate::process::Cmd;

const MIB: u64 = 1024 * 1024;

/// Identifiers stamped on a freshly built disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUuids {
    /// ext4 filesystem UUID of the root partition.
    pub root_fs_uuid: String,
    /// vfat volume serial of the ESP (`XXXX-XXXX`).
    pub efi_fs_uuid: String,
    /// GPT PARTUUID of the root partition.
    pub root_part_uuid: String,
}

impl DiskUuids {
    pub fn generate() -> Result<Self> {
        generate_disk_uuids()
    }
}

/// Generate new random UUIDs for a disk image.
pub fn generate_disk_uuids() -> Result<DiskUuids> {
    Ok(DiskUuids {
        root_fs_uuid: generate_uuid()?,
        efi_fs_uuid: generate_vfat_serial()?,
        root_part_uuid: generate_uuid()?,
    })
}

/// Generate a random UUID using uuidgen.
pub fn generate_uuid() -> Result<String> {
    let result = Cmd::new("uuidgen")
        .error_msg("uuidgen failed")
        .run()?;
    Ok(result.stdout_trimmed().to_lowercase())
}

/// Generate a random FAT32 volume serial (8 hex chars, e.g., "ABCD-1234").
pub fn generate_vfat_serial() -> Result<String> {
    vfat_serial_from_uuid(&generate_uuid()?)
}

fn vfat_serial_from_uuid(uuid: &str) -> Result<String> {
    let hex: String = uuid
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect();
    if hex.len() < 8 {
        bail!("Failed to generate vfat serial");
    }
    Ok(format!(
        "{}-{}",
        &hex[0..4].to_uppercase(),
        &hex[4..8].to_uppercase()
    ))
}

/// Bytes used by the tree at `path`, as reported by `du -s` (KiB).
pub fn size_on_disk_bytes(path: &Path) -> Result<u64> {
    let result = Cmd::new("du")
        .arg("-s")
        .arg_path(path)
        .error_msg(format!("failed to find disk usage of ({})", path.display()))
        .run()?;
    parse_du_kib(&result.stdout)
        .with_context(|| format!("failed to parse disk usage of ({})", path.display()))
        .map(|kib| kib * 1024)
}

fn parse_du_kib(output: &str) -> Result<u64> {
    let Some(field) = output.split_whitespace().next() else {
        bail!("empty du output");
    };
    field
        .parse::<u64>()
        .with_context(|| format!("unexpected du output ({})", output.trim()))
}

/// Root partition size for `content_bytes` of data: whole megabytes, one
/// extra for block rounding, times the expansion safety factor.
pub fn disk_size_estimate_mb(content_bytes: u64) -> u64 {
    let content_mb = content_bytes / MIB + 1;
    (content_mb as f64 * EXPANSION_SAFETY_FACTOR).ceil() as u64
}
