//! Preflight checks for build validation.
//!
//! Validates that the host system has required tools and privileges before
//! building. This prevents cryptic errors halfway through a build that has
//! already attached loop devices.
//!
//! # Example
//!
//! ```rust
//! use liveos_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("mksquashfs") {
//!     println!("squashfs-tools not installed");
//! }
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::process::{self, Cmd};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Host tools needed to turn a full image or an ISO into a LiveOS ISO.
///
/// Each tuple is (command_name, package_name).
pub const ISO_BUILD_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("lsblk", "util-linux"),
    ("chroot", "coreutils"),
    ("cp", "coreutils"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("mkfs.fat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("lsinitrd", "dracut"),
];

/// Host tools needed to materialize a writeable disk image from a squashfs.
pub const DISK_BUILD_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mcopy", "mtools"),
    ("uuidgen", "util-linux"),
    ("du", "coreutils"),
    ("cp", "coreutils"),
    ("dd", "coreutils"),
];

/// Needed only when the input full image is not a raw image.
pub const IMAGE_CONVERSION_TOOLS: &[(&str, &str)] = &[("qemu-img", "qemu-img")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Tools from `tools` that are not on PATH.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}

/// Loop devices, mounts and chroots all need root.
pub fn require_root() -> Result<()> {
    if !is_root() {
        bail!("this operation requires root privileges (loop devices, mounts and chroot)");
    }
    Ok(())
}

/// Whether the effective user is root, as reported by `id -u`.
pub fn is_root() -> bool {
    Cmd::new("id")
        .arg("-u")
        .run()
        .map(|result| is_root_uid(result.stdout_trimmed()))
        .unwrap_or(false)
}

fn is_root_uid(uid: &str) -> bool {
    uid.trim() == "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_names_package() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz"));
        assert!(err.contains("fake-package"));
    }

    #[test]
    fn root_uid_parsing() {
        assert!(is_root_uid("0"));
        assert!(is_root_uid("0\n"));
        assert!(!is_root_uid("1000"));
        assert!(!is_root_uid("10"));
        assert!(!is_root_uid(""));
    }

    #[test]
    fn is_root_agrees_with_id() {
        let uid = Cmd::new("id").arg("-u").run().unwrap();
        assert_eq!(is_root(), uid.stdout_trimmed() == "0");
    }

    #[test]
    fn tool_tables_name_the_formatters_actually_run() {
        let listed = |tools: &[(&str, &str)], tool: &str| tools.iter().any(|(t, _)| *t == tool);
        assert!(listed(ISO_BUILD_TOOLS, crate::artifact::iso_utils::EFIBOOT_MKFS));
        assert!(listed(DISK_BUILD_TOOLS, crate::artifact::disk::partitions::ESP_MKFS));
        assert!(listed(DISK_BUILD_TOOLS, "mkfs.ext4"));
    }

    #[test]
    fn tool_tables_are_well_formed() {
        for (tool, package) in ISO_BUILD_TOOLS
            .iter()
            .chain(DISK_BUILD_TOOLS)
            .chain(IMAGE_CONVERSION_TOOLS)
        {
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }
}
