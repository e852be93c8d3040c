//! Disk assembly: GPT creation and partition splicing.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::helpers::DiskUuids;
use crate::layout::{ESP_END_MIB, ESP_START_MIB};
use crate::process::Cmd;

/// Sector size in bytes.
const SECTOR_SIZE: u64 = 512;

const SECTORS_PER_MIB: u64 = 1024 * 1024 / SECTOR_SIZE;

/// Room left after the root partition for the backup GPT.
pub const GPT_TRAILER_MIB: u64 = 1;

/// Total disk size holding the ESP and a `root_mb` root partition.
pub fn disk_size_mb(root_mb: u64) -> u64 {
    ESP_END_MIB + root_mb + GPT_TRAILER_MIB
}

/// ESP from 1 MiB to 9 MiB, root from 9 MiB filling `root_mb`.
pub fn sfdisk_script(root_mb: u64, uuids: &DiskUuids) -> String {
    let esp_start = ESP_START_MIB * SECTORS_PER_MIB;
    let esp_size = (ESP_END_MIB - ESP_START_MIB) * SECTORS_PER_MIB;
    let root_start = ESP_END_MIB * SECTORS_PER_MIB;
    format!(
        "label: gpt\n\
         start={}, size={}, type=U, name=esp\n\
         start={}, size={}, type=L, name=rootfs, uuid={}\n",
        esp_start,
        esp_size,
        root_start,
        root_mb * SECTORS_PER_MIB,
        uuids.root_part_uuid.to_uppercase()
    )
}

/// Assemble a raw GPT disk image from partition images.
///
/// Creates a sparse disk file with GPT partition table, then splices
/// the EFI and root partition images at their correct offsets.
pub fn assemble_disk(
    disk_path: &Path,
    efi_image: &Path,
    root_image: &Path,
    root_mb: u64,
    uuids: &DiskUuids,
) -> Result<()> {
    {
        let file = fs::File::create(disk_path)
            .with_context(|| format!("failed to create ({})", disk_path.display()))?;
        file.set_len(disk_size_mb(root_mb) * 1024 * 1024)?;
    }

    Cmd::new("sfdisk")
        .arg_path(disk_path)
        .stdin(sfdisk_script(root_mb, uuids))
        .error_msg("sfdisk failed to create partition table")
        .run()?;

    splice(disk_path, efi_image, ESP_START_MIB).context("failed to write EFI partition")?;
    splice(disk_path, root_image, ESP_END_MIB).context("failed to write root partition")?;
    Ok(())
}

fn splice(disk_path: &Path, partition: &Path, offset_mib: u64) -> Result<()> {
    Cmd::new("dd")
        .arg(format!("if={}", partition.display()))
        .arg(format!("of={}", disk_path.display()))
        .args(["bs=1M", "conv=notrunc,sparse"])
        .arg(format!("seek={}", offset_mib))
        .error_msg(format!("dd failed for {}", partition.display()))
        .run()?;
    Ok(())
}
