//! LiveOS ISO builds.
//!
//! Three entry points share one builder:
//!
//! - [`create_liveos_iso_from_image`]: full disk image to ISO
//! - [`create_liveos_iso_from_iso`]: existing LiveOS ISO to a re-customized ISO,
//!   either reusing its OS or regenerating it
//! - [`create_writeable_image_from_iso`]: existing LiveOS ISO to a writeable
//!   raw disk image
//!
//! Every run owns the `tmp` subtree of its build directory. Two runs must not
//! share a build directory; nothing here locks it.

pub mod assemble;
pub mod iso_input;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::artifact::disk::create_writeable_image_from_squashfs;
use crate::artifact::filesystem::copy_tree_preserving;
use crate::artifact::initramfs::{build_initrd, DracutOptions};
use crate::artifact::iso::{IsoWriter, XorrisoIsoWriter};
use crate::artifact::squashfs::build_squashfs;
use crate::build::context::IsoArtifacts;
use crate::build::dracut::DracutPackageInfo;
use crate::build::rootfs::{
    extract_boot_dir_files, find_kernel_version, prepare_rootfs_for_dracut, stage_initrd_artifacts,
};
use crate::cleanup::{merge_cleanup_error, prepare_work_dir, CleanupDirs};
use crate::config::{BuildConfig, CustomizationOptions, WorkingDirs};
use crate::grub::rewrite::update_grub_cfg;
use crate::layout::{
    INITRD_ARTIFACTS_DIR, INITRD_IMAGE, INITRD_REQUIRED_PACKAGES, INITRD_STAGING_DIR, ISO_BOOT_DIR,
    LIVEOS_DIR, LIVEOS_IMAGE,
};
use crate::mount::ImageConnection;
use crate::saved_config::{update_saved_configs, NewConfigs};

const IMAGE_MOUNT_DIR: &str = "imageroot";
const WRITEABLE_ROOTFS_DIR: &str = "writeable-rootfs";
const ISO_EXPANSION_DIR: &str = "from-iso";
const REGENERATED_IMAGE: &str = "regenerated-os.raw";

/// Rootfs customization run on the writeable disk image between expanding
/// an input ISO and rebuilding the LiveOS from it.
pub type DiskImageHook<'a> = &'a dyn Fn(&Path) -> Result<()>;

/// What to do with the OS of an input ISO.
#[derive(Clone, Copy, Default)]
pub enum OsRegeneration<'a> {
    /// Reuse its squashfs and initrd; only grub, saved configs and extra
    /// files change.
    #[default]
    Keep,
    /// Rebuild squashfs and initrd from a writeable image of its squashfs.
    Regenerate { hook: Option<DiskImageHook<'a>> },
}

/// State of one build: its working directories, the artifacts produced so
/// far and the directories to remove at the end.
pub struct LiveOsIsoBuilder<'w> {
    dirs: WorkingDirs,
    artifacts: IsoArtifacts,
    cleanup: CleanupDirs,
    writer: &'w dyn IsoWriter,
}

impl<'w> LiveOsIsoBuilder<'w> {
    /// Prepare fresh working directories for a build.
    pub fn new(config: &BuildConfig, writer: &'w dyn IsoWriter) -> Result<Self> {
        let dirs = config.working_dirs();
        let mut cleanup = CleanupDirs::new();
        cleanup.register(&dirs.iso_build_dir);

        let artifacts_dir = &dirs.iso_artifacts_dir;
        let parent = artifacts_dir.parent().unwrap_or(&dirs.iso_build_dir);
        let name = artifacts_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifacts");
        prepare_work_dir(parent, name)?;

        Ok(Self {
            artifacts: IsoArtifacts::new(artifacts_dir),
            dirs,
            cleanup,
            writer,
        })
    }

    pub fn artifacts(&self) -> &IsoArtifacts {
        &self.artifacts
    }

    /// Remove every directory this build registered.
    pub fn clean_up(&mut self) -> Result<()> {
        self.cleanup.clean_up()
    }

    /// Where the image's root filesystem is copied to and turned into a
    /// LiveOS root.
    pub fn writeable_rootfs_dir(&self) -> PathBuf {
        self.dirs.iso_build_dir.join(WRITEABLE_ROOTFS_DIR)
    }

    /// Where the squashfs lands on the media.
    pub fn squashfs_path(&self) -> PathBuf {
        self.dirs.iso_artifacts_dir.join(LIVEOS_DIR).join(LIVEOS_IMAGE)
    }

    /// Path (a): mount `image`, turn a copy of its root into a LiveOS and
    /// produce the squashfs and initrd.
    ///
    /// `input_saved_configs` seeds the merge (from an input ISO); `carry_over`
    /// contributes additional files this build does not produce itself.
    pub fn prepare_artifacts_from_full_image(
        &mut self,
        image: &Path,
        options: &CustomizationOptions,
        input_saved_configs: Option<&Path>,
        carry_over: Option<&IsoArtifacts>,
    ) -> Result<()> {
        let rootfs = self.writeable_rootfs_dir();
        self.copy_image_rootfs(image, &rootfs)?;
        self.inspect_rootfs(&rootfs)?;
        self.seed_saved_configs(input_saved_configs)?;
        self.update_configs(options)?;
        self.prepare_live_rootfs(&rootfs)?;
        let squashfs = self.squashfs_path();
        self.build_squashfs_image(&rootfs, &squashfs)?;
        self.build_live_initrd(&rootfs)?;

        if let Some(input) = carry_over {
            self.artifacts.carry_over_from(input);
        }
        Ok(())
    }

    /// Copy the root filesystem (and everything its fstab mounts) of `image`
    /// to `dest`.
    pub fn copy_image_rootfs(&mut self, image: &Path, dest: &Path) -> Result<()> {
        info!("copying root filesystem of {}", image.display());
        let connection = ImageConnection::connect(image, &self.dirs.iso_build_dir, IMAGE_MOUNT_DIR)
            .with_context(|| format!("failed to connect to image ({})", image.display()))?;

        let copied = prepare_work_dir(
            dest.parent().unwrap_or(&self.dirs.iso_build_dir),
            WRITEABLE_ROOTFS_DIR,
        )
        .and_then(|_| copy_tree_preserving(connection.root_dir(), dest))
        .context("failed to copy the image root filesystem");
        merge_cleanup_error(copied, connection.close())
    }

    /// Record the kernel and dracut of `rootfs` and stage its `/boot` files.
    pub fn inspect_rootfs(&mut self, rootfs: &Path) -> Result<()> {
        info!("preparing LiveOS root filesystem");
        self.artifacts.kernel_version = Some(find_kernel_version(rootfs)?);
        let dracut_info =
            DracutPackageInfo::detect(rootfs).context("failed to find the dracut package version")?;
        self.artifacts.dracut_package_info = Some(dracut_info);

        extract_boot_dir_files(rootfs, &self.dirs.iso_artifacts_dir, &mut self.artifacts)
    }

    /// Start from the saved configs of an input ISO, if it carries any.
    pub fn seed_saved_configs(&mut self, input: Option<&Path>) -> Result<()> {
        let Some(input) = input.filter(|p| p.exists()) else {
            return Ok(());
        };
        let target = &self.artifacts.saved_configs_file;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ({})", parent.display()))?;
        }
        fs::copy(input, target).with_context(|| {
            format!("failed to copy saved configs ({}) to ({})", input.display(), target.display())
        })?;
        Ok(())
    }

    /// Stage the initrd's boot artifacts in `rootfs` and configure dracut.
    pub fn prepare_live_rootfs(&self, rootfs: &Path) -> Result<()> {
        stage_initrd_artifacts(rootfs, &self.artifacts)?;
        prepare_rootfs_for_dracut(rootfs)
    }

    pub fn build_squashfs_image(&mut self, rootfs: &Path, output: &Path) -> Result<()> {
        build_squashfs(rootfs, output)?;
        self.artifacts.squashfs_image = Some(output.to_path_buf());
        Ok(())
    }

    /// Run dracut inside `rootfs`; the initrd lands next to the kernel.
    pub fn build_live_initrd(&mut self, rootfs: &Path) -> Result<()> {
        let Some(kernel_version) = self.artifacts.kernel_version.as_deref() else {
            bail!("kernel version was not detected");
        };
        let initrd = self.dirs.iso_artifacts_dir.join(ISO_BOOT_DIR).join(INITRD_IMAGE);
        let include_source = format!("/{}", INITRD_STAGING_DIR);
        let dracut_options = DracutOptions {
            kernel_version,
            filesystems: &["squashfs"],
            include_source: &include_source,
            include_target: INITRD_ARTIFACTS_DIR,
            required_packages: INITRD_REQUIRED_PACKAGES,
        };
        let initrd = build_initrd(rootfs, &initrd, &dracut_options)?;
        self.artifacts.initrd_image = Some(initrd);
        Ok(())
    }

    /// Merge this run's options into the saved configs and rewrite grub.
    pub fn update_configs(&mut self, options: &CustomizationOptions) -> Result<()> {
        let saved = update_saved_configs(
            &self.artifacts.saved_configs_file,
            NewConfigs {
                extra_command_line: &options.kernel_extra_args,
                pxe: &options.pxe,
                dracut_package_info: self.artifacts.dracut_package_info.as_ref(),
            },
        )?;

        let (Some(iso_cfg), Some(pxe_cfg)) = (&self.artifacts.iso_grub_cfg, &self.artifacts.pxe_grub_cfg)
        else {
            bail!("failed to find grub.cfg");
        };
        update_grub_cfg(iso_cfg, pxe_cfg, &saved, &options.image_name())?;
        Ok(())
    }

    /// Path (b) without OS regeneration: take the artifacts of an expanded
    /// ISO as they are and refresh the configuration.
    pub fn adopt_iso_artifacts(&mut self, input: IsoArtifacts, options: &CustomizationOptions) -> Result<()> {
        self.artifacts = input;
        self.artifacts.dracut_package_info = None;
        self.update_configs(options)
    }

    pub fn create_iso_and_pxe(&self, options: &CustomizationOptions) -> Result<PathBuf> {
        assemble::create_iso_and_pxe(self.writer, &self.dirs, &self.artifacts, options)
    }
}

/// Run `build` with a fresh builder and clean up afterwards, merging any
/// cleanup failure into the result.
fn with_builder<T>(
    config: &BuildConfig,
    writer: &dyn IsoWriter,
    build: impl FnOnce(&mut LiveOsIsoBuilder) -> Result<T>,
) -> Result<T> {
    let mut builder = LiveOsIsoBuilder::new(config, writer)?;
    let result = build(&mut builder);
    merge_cleanup_error(result, builder.clean_up())
}

/// Build a LiveOS ISO (and optionally PXE artifacts) from a full disk image.
pub fn create_liveos_iso_from_image(
    config: &BuildConfig,
    options: &CustomizationOptions,
    image: &Path,
) -> Result<PathBuf> {
    create_liveos_iso_from_image_with(&XorrisoIsoWriter, config, options, image)
}

pub fn create_liveos_iso_from_image_with(
    writer: &dyn IsoWriter,
    config: &BuildConfig,
    options: &CustomizationOptions,
    image: &Path,
) -> Result<PathBuf> {
    options.validate()?;
    with_builder(config, writer, |builder| {
        builder.prepare_artifacts_from_full_image(image, options, None, None)?;
        builder.create_iso_and_pxe(options)
    })
}

/// Re-customize an existing LiveOS ISO.
pub fn create_liveos_iso_from_iso(
    config: &BuildConfig,
    options: &CustomizationOptions,
    iso: &Path,
    regeneration: OsRegeneration,
) -> Result<PathBuf> {
    create_liveos_iso_from_iso_with(&XorrisoIsoWriter, config, options, iso, regeneration)
}

pub fn create_liveos_iso_from_iso_with(
    writer: &dyn IsoWriter,
    config: &BuildConfig,
    options: &CustomizationOptions,
    iso: &Path,
    regeneration: OsRegeneration,
) -> Result<PathBuf> {
    options.validate()?;
    with_builder(config, writer, |builder| {
        let expansion_dir = builder.dirs.iso_build_dir.join(ISO_EXPANSION_DIR);
        let input = expand_iso(iso, &expansion_dir, &builder.dirs.iso_build_dir)?;

        match regeneration {
            OsRegeneration::Keep => {
                info!("reusing the OS of {}", iso.display());
                builder.adopt_iso_artifacts(input, options)?;
            }
            OsRegeneration::Regenerate { hook } => {
                info!("regenerating the OS of {}", iso.display());
                let Some(squashfs) = input.squashfs_image.as_deref() else {
                    bail!("iso ({}) has no LiveOS squashfs image", iso.display());
                };
                let raw = builder.dirs.iso_build_dir.join(REGENERATED_IMAGE);
                create_writeable_image_from_squashfs(squashfs, &builder.dirs.iso_build_dir, &raw)?;
                if let Some(hook) = hook {
                    hook(&raw).context("failed to customize the regenerated disk image")?;
                }
                builder.prepare_artifacts_from_full_image(
                    &raw,
                    options,
                    Some(&input.saved_configs_file),
                    Some(&input),
                )?;
            }
        }
        builder.create_iso_and_pxe(options)
    })
}

/// Turn an existing LiveOS ISO back into a writeable raw disk image.
pub fn create_writeable_image_from_iso(config: &BuildConfig, iso: &Path, output: &Path) -> Result<PathBuf> {
    let dirs = config.working_dirs();
    let mut cleanup = CleanupDirs::new();
    cleanup.register(&dirs.iso_build_dir);

    let result = (|| -> Result<PathBuf> {
        let expansion_dir = dirs.iso_build_dir.join(ISO_EXPANSION_DIR);
        let input = expand_iso(iso, &expansion_dir, &dirs.iso_build_dir)?;
        let Some(squashfs) = input.squashfs_image.as_deref() else {
            bail!("iso ({}) has no LiveOS squashfs image", iso.display());
        };
        create_writeable_image_from_squashfs(squashfs, &dirs.iso_build_dir, output)
    })();
    merge_cleanup_error(result, cleanup.clean_up())
}

fn expand_iso(iso: &Path, dest: &Path, build_dir: &Path) -> Result<IsoArtifacts> {
    let parent = dest.parent().unwrap_or(build_dir);
    prepare_work_dir(parent, ISO_EXPANSION_DIR)?;
    iso_input::extract_iso(iso, dest, build_dir)?;
    iso_input::scan_iso_media(dest)
}
