//! Build configuration and user customization options.
//!
//! [`BuildConfig`] is the explicit layout value threaded through every
//! component. [`CustomizationOptions`] is what the operator asks for: extra
//! kernel arguments, extra media files, a PXE target and output naming. It is
//! loaded from TOML and then overridden by command-line flags.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::iso::FileToCopy;
use crate::error::LiveOsError;

/// Scratch layout for one build.
///
/// ```text
/// build_dir (might be shared with other tools)
///  |--tmp            (this builder only)
///     |--<mount points, writeable rootfs>
///     |--artifacts   (extracted and generated artifacts)
///     |--isomaker-tmp (owned by the ISO writer, deleted/re-created by it)
/// ```
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub build_dir: PathBuf,
}

impl BuildConfig {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
        }
    }

    pub fn working_dirs(&self) -> WorkingDirs {
        let iso_build_dir = self.build_dir.join("tmp");
        WorkingDirs {
            iso_artifacts_dir: iso_build_dir.join("artifacts"),
            iso_writer_dir: iso_build_dir.join("isomaker-tmp"),
            iso_build_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirs {
    /// Intermediate files (mount points, writeable rootfs).
    pub iso_build_dir: PathBuf,
    /// Extracted and generated artifacts.
    pub iso_artifacts_dir: PathBuf,
    /// Exclusive to the ISO writer; must differ from `iso_build_dir`.
    pub iso_writer_dir: PathBuf,
}

/// Output image name: `{base_name}{release_version}{tag}.iso`.
///
/// Release version and tag are currently always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoImageName {
    pub base_name: String,
    pub release_version: String,
    pub tag: String,
}

impl IsoImageName {
    pub fn from_base_name(base_name: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            release_version: String::new(),
            tag: String::new(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}{}.iso", self.base_name, self.release_version, self.tag)
    }
}

/// Where PXE clients download the ISO from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PxeTarget {
    /// Folder URL; the generated ISO file name is appended.
    pub iso_image_base_url: String,
    /// Full URL of the ISO file.
    pub iso_image_file_url: String,
}

impl PxeTarget {
    pub fn validate(&self) -> Result<()> {
        if !self.iso_image_base_url.is_empty() && !self.iso_image_file_url.is_empty() {
            return Err(LiveOsError::PxeUrlConflict.into());
        }
        Ok(())
    }
}

/// Resolved customization options for one run.
#[derive(Debug, Clone, Default)]
pub struct CustomizationOptions {
    pub kernel_extra_args: String,
    pub additional_files: Vec<FileToCopy>,
    pub pxe: PxeTarget,
    pub output_dir: PathBuf,
    pub output_base_name: String,
    pub pxe_artifacts_dir: Option<PathBuf>,
}

impl CustomizationOptions {
    /// Load options from a TOML file. Relative paths resolve against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading options file '{}'", path.display()))?;
        let parsed: OptionsToml = toml::from_str(&text)
            .with_context(|| format!("parsing options file '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        parsed.resolve(base_dir)
    }

    pub fn image_name(&self) -> IsoImageName {
        IsoImageName::from_base_name(&self.output_base_name)
    }

    /// Check the options before anything on disk is touched.
    pub fn validate(&self) -> Result<()> {
        self.pxe.validate()?;
        if self.output_base_name.trim().is_empty() {
            bail!("output base name must not be empty");
        }
        if self.output_dir.as_os_str().is_empty() {
            bail!("output directory must not be empty");
        }
        for file in &self.additional_files {
            file.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsToml {
    #[serde(default)]
    iso: IsoToml,
    #[serde(default)]
    pxe: PxeToml,
    #[serde(default)]
    output: OutputToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IsoToml {
    #[serde(default)]
    kernel_extra_args: String,
    #[serde(default)]
    additional_files: Vec<AdditionalFileToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdditionalFileToml {
    source: Option<String>,
    content: Option<String>,
    destination: String,
    permissions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PxeToml {
    #[serde(default)]
    iso_image_base_url: String,
    #[serde(default)]
    iso_image_file_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputToml {
    dir: Option<String>,
    base_name: Option<String>,
    pxe_artifacts_dir: Option<String>,
}

impl OptionsToml {
    fn resolve(self, base_dir: &Path) -> Result<CustomizationOptions> {
        let additional_files = self
            .iso
            .additional_files
            .into_iter()
            .map(|file| file.resolve(base_dir))
            .collect::<Result<Vec<_>>>()?;

        Ok(CustomizationOptions {
            kernel_extra_args: self.iso.kernel_extra_args.trim().to_string(),
            additional_files,
            pxe: PxeTarget {
                iso_image_base_url: self.pxe.iso_image_base_url.trim().to_string(),
                iso_image_file_url: self.pxe.iso_image_file_url.trim().to_string(),
            },
            output_dir: self
                .output
                .dir
                .map(|dir| resolve_path(base_dir, &dir))
                .unwrap_or_default(),
            output_base_name: self.output.base_name.unwrap_or_default(),
            pxe_artifacts_dir: self
                .output
                .pxe_artifacts_dir
                .map(|dir| resolve_path(base_dir, &dir)),
        })
    }
}

impl AdditionalFileToml {
    fn resolve(self, base_dir: &Path) -> Result<FileToCopy> {
        let permissions = self
            .permissions
            .as_deref()
            .map(parse_permissions)
            .transpose()
            .with_context(|| format!("invalid permissions for '{}'", self.destination))?;

        Ok(FileToCopy {
            source: self.source.map(|src| resolve_path(base_dir, &src)),
            content: self.content,
            destination: PathBuf::from(self.destination),
            permissions,
            no_dereference: false,
        })
    }
}

pub(crate) fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// Parse octal permission bits such as `644`, `0644` or `0o644`.
pub fn parse_permissions(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    let mode = u32::from_str_radix(digits, 8)
        .with_context(|| format!("'{}' is not an octal permission value", raw))?;
    if mode > 0o7777 {
        bail!("permission value '{}' is out of range", raw);
    }
    Ok(mode)
}
