//! Customization options persisted inside the ISO.
//!
//! Every build reads the saved configuration carried by its input (if any),
//! merges the new run's options into it and writes the result back so it
//! travels with the output ISO. This is what lets a second customization of
//! the same ISO append to, rather than replace, the first one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::build::dracut::DracutPackageInfo;
use crate::config::PxeTarget;
use crate::error::LiveOsError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConfigs {
    #[serde(default)]
    pub iso: SavedIso,
    #[serde(default)]
    pub pxe: SavedPxe,
    #[serde(default)]
    pub os: SavedOs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedIso {
    #[serde(default)]
    pub kernel_command_line: SavedKernelCommandLine,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedKernelCommandLine {
    #[serde(default)]
    pub extra_command_line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPxe {
    #[serde(default)]
    pub iso_image_base_url: String,
    #[serde(default)]
    pub iso_image_file_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedOs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dracut_package_info: Option<DracutPackageInfo>,
}

/// Options supplied by the current run.
#[derive(Debug, Clone, Copy)]
pub struct NewConfigs<'a> {
    pub extra_command_line: &'a str,
    pub pxe: &'a PxeTarget,
    /// `None` when this run did not expand a rootfs.
    pub dracut_package_info: Option<&'a DracutPackageInfo>,
}

impl SavedConfigs {
    /// Load saved configurations; a missing file is `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read saved configurations ({})", path.display()))?;
        let configs = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse saved configurations ({})", path.display()))?;
        Ok(Some(configs))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create folder ({})", parent.display()))?;
        }
        let text = serde_yaml::to_string(self).context("failed to serialize saved configurations")?;
        fs::write(path, text)
            .with_context(|| format!("failed to write saved configurations ({})", path.display()))?;
        Ok(())
    }

    pub fn pxe_target(&self) -> PxeTarget {
        PxeTarget {
            iso_image_base_url: self.pxe.iso_image_base_url.clone(),
            iso_image_file_url: self.pxe.iso_image_file_url.clone(),
        }
    }
}

/// Merge the current run's options into what an earlier build saved.
///
/// - extra kernel arguments accumulate, earlier first, separated by one space
/// - a non-empty PXE URL replaces its field and clears the other form
/// - dracut information carries forward when this run has none
pub fn merge(existing: Option<&SavedConfigs>, new: NewConfigs<'_>) -> Result<SavedConfigs> {
    new.pxe.validate()?;

    let mut merged = existing.cloned().unwrap_or_default();

    let args: Vec<&str> = [
        merged.iso.kernel_command_line.extra_command_line.trim(),
        new.extra_command_line.trim(),
    ]
    .into_iter()
    .filter(|a| !a.is_empty())
    .collect();
    merged.iso.kernel_command_line.extra_command_line = args.join(" ");

    if !new.pxe.iso_image_base_url.is_empty() {
        merged.pxe.iso_image_base_url = new.pxe.iso_image_base_url.clone();
        merged.pxe.iso_image_file_url.clear();
    }
    if !new.pxe.iso_image_file_url.is_empty() {
        merged.pxe.iso_image_file_url = new.pxe.iso_image_file_url.clone();
        merged.pxe.iso_image_base_url.clear();
    }
    if !merged.pxe.iso_image_base_url.is_empty() && !merged.pxe.iso_image_file_url.is_empty() {
        // Only reachable from a hand-edited file.
        return Err(LiveOsError::PxeUrlConflict.into());
    }

    if let Some(info) = new.dracut_package_info {
        merged.os.dracut_package_info = Some(info.clone());
    }

    Ok(merged)
}

/// Load, merge and write back the saved configurations at `path`.
pub fn update_saved_configs(path: &Path, new: NewConfigs<'_>) -> Result<SavedConfigs> {
    let existing = SavedConfigs::load(path)?;
    let merged = merge(existing.as_ref(), new)
        .context("failed to combine saved configurations with new configuration")?;
    merged
        .persist(path)
        .context("failed to save iso configs")?;
    debug!("saved configurations updated at {}", path.display());
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dracut(release: &str) -> DracutPackageInfo {
        DracutPackageInfo {
            package_version: "102".into(),
            package_release: release.into(),
        }
    }

    fn saved(args: &str, base: &str, file: &str, info: Option<DracutPackageInfo>) -> SavedConfigs {
        SavedConfigs {
            iso: SavedIso {
                kernel_command_line: SavedKernelCommandLine {
                    extra_command_line: args.into(),
                },
            },
            pxe: SavedPxe {
                iso_image_base_url: base.into(),
                iso_image_file_url: file.into(),
            },
            os: SavedOs {
                dracut_package_info: info,
            },
        }
    }

    fn new<'a>(args: &'a str, pxe: &'a PxeTarget, info: Option<&'a DracutPackageInfo>) -> NewConfigs<'a> {
        NewConfigs {
            extra_command_line: args,
            pxe,
            dracut_package_info: info,
        }
    }

    #[test]
    fn kernel_args_concatenate_with_single_space() {
        let existing = saved(" a ", "", "", None);
        let pxe = PxeTarget::default();
        let merged = merge(Some(&existing), new(" b", &pxe, None)).unwrap();
        assert_eq!(merged.iso.kernel_command_line.extra_command_line, "a b");

        let merged = merge(Some(&existing), new("", &pxe, None)).unwrap();
        assert_eq!(merged.iso.kernel_command_line.extra_command_line, "a");

        let merged = merge(None, new("  b  ", &pxe, None)).unwrap();
        assert_eq!(merged.iso.kernel_command_line.extra_command_line, "b");
    }

    #[test]
    fn pxe_urls_stay_mutually_exclusive() {
        let existing = saved("", "http://host/liveos", "", None);

        let file_pxe = PxeTarget {
            iso_image_file_url: "http://host/a.iso".into(),
            ..Default::default()
        };
        let merged = merge(Some(&existing), new("", &file_pxe, None)).unwrap();
        assert_eq!(merged.pxe.iso_image_file_url, "http://host/a.iso");
        assert!(merged.pxe.iso_image_base_url.is_empty());

        let base_pxe = PxeTarget {
            iso_image_base_url: "http://other/liveos".into(),
            ..Default::default()
        };
        let merged = merge(Some(&merged), new("", &base_pxe, None)).unwrap();
        assert_eq!(merged.pxe.iso_image_base_url, "http://other/liveos");
        assert!(merged.pxe.iso_image_file_url.is_empty());

        let merged = merge(Some(&merged), new("", &PxeTarget::default(), None)).unwrap();
        assert_eq!(merged.pxe.iso_image_base_url, "http://other/liveos");
    }

    #[test]
    fn both_new_urls_are_rejected() {
        let pxe = PxeTarget {
            iso_image_base_url: "http://host/liveos".into(),
            iso_image_file_url: "http://host/a.iso".into(),
        };
        assert!(merge(None, new("", &pxe, None)).is_err());
    }

    #[test]
    fn dracut_info_carries_forward() {
        let existing = saved("", "", "", Some(dracut("7.azl3")));
        let pxe = PxeTarget::default();

        let merged = merge(Some(&existing), new("", &pxe, None)).unwrap();
        assert_eq!(merged.os.dracut_package_info, Some(dracut("7.azl3")));

        let newer = dracut("9.azl3");
        let merged = merge(Some(&existing), new("", &pxe, Some(&newer))).unwrap();
        assert_eq!(merged.os.dracut_package_info, Some(newer));
    }

    #[test]
    fn update_creates_then_appends() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("azl-image-customizer/saved-configs.yaml");
        let pxe = PxeTarget::default();
        let info = dracut("7.azl3");

        update_saved_configs(&path, new("console=ttyS0", &pxe, Some(&info))).unwrap();
        let second = update_saved_configs(&path, new("quiet", &pxe, None)).unwrap();

        assert_eq!(second.iso.kernel_command_line.extra_command_line, "console=ttyS0 quiet");
        assert_eq!(second.os.dracut_package_info, Some(info));
        assert_eq!(SavedConfigs::load(&path).unwrap(), Some(second));
    }

    #[test]
    fn loads_camel_case_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("saved-configs.yaml");
        fs::write(
            &path,
            "iso:\n  kernelCommandLine:\n    extraCommandLine: rd.debug\npxe:\n  isoImageFileUrl: http://h/x.iso\nos:\n  dracutPackageInfo:\n    packageVersion: \"102\"\n    packageRelease: 7.azl3\n",
        )
        .unwrap();
        let configs = SavedConfigs::load(&path).unwrap().unwrap();
        assert_eq!(configs.iso.kernel_command_line.extra_command_line, "rd.debug");
        assert_eq!(configs.pxe.iso_image_file_url, "http://h/x.iso");
        assert_eq!(configs.os.dracut_package_info, Some(dracut("7.azl3")));
        assert_eq!(SavedConfigs::load(&temp.path().join("missing.yaml")).unwrap(), None);
    }
}
