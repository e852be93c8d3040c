//! liveos-builder - LiveOS ISO and PXE artifact builder.
//!
//! Turns a full OS disk image into a bootable LiveOS ISO, re-customizes an
//! existing LiveOS ISO, or turns one back into a writeable disk image.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use liveos_builder::config::{BuildConfig, CustomizationOptions};
use liveos_builder::liveos::{self, OsRegeneration};
use liveos_builder::mount::image::ImageFormat;
use liveos_builder::preflight::{
    self, DISK_BUILD_TOOLS, IMAGE_CONVERSION_TOOLS, ISO_BUILD_TOOLS,
};

#[derive(Parser)]
#[command(name = "liveos-builder")]
#[command(about = "LiveOS ISO and PXE artifact builder")]
#[command(
    after_help = "QUICK START:\n  liveos-builder preflight                   Check host tools\n  liveos-builder build --image disk.qcow2    Full image to LiveOS ISO\n  liveos-builder rebuild --iso live.iso      Re-customize an ISO"
)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a LiveOS ISO from a full disk image (raw, qcow2, vhd, vhdx)
    Build {
        /// Full disk image with boot and root partitions
        #[arg(long)]
        image: PathBuf,

        #[command(flatten)]
        options: IsoArgs,
    },

    /// Re-customize an existing LiveOS ISO
    Rebuild {
        /// LiveOS ISO produced by an earlier build
        #[arg(long)]
        iso: PathBuf,

        /// Rebuild the squashfs and initrd instead of reusing them
        #[arg(long)]
        regenerate_os: bool,

        #[command(flatten)]
        options: IsoArgs,
    },

    /// Turn a LiveOS ISO back into a writeable raw disk image
    ToDisk {
        /// LiveOS ISO produced by an earlier build
        #[arg(long)]
        iso: PathBuf,

        /// Output raw disk image
        #[arg(long)]
        output: PathBuf,

        /// Scratch directory (a `tmp` subdirectory is created and removed)
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,
    },

    /// Check host tools and privileges
    Preflight {
        /// Fail if any check fails (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Args)]
struct IsoArgs {
    /// Options file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scratch directory (a `tmp` subdirectory is created and removed)
    #[arg(long, default_value = "build")]
    build_dir: PathBuf,

    /// Directory the ISO is written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// ISO base name (`<name>.iso`)
    #[arg(long)]
    output_name: Option<String>,

    /// Extra kernel command line, appended to earlier builds' arguments
    #[arg(long)]
    extra_cmdline: Option<String>,

    /// URL of the folder PXE clients download the ISO from
    #[arg(long, conflicts_with = "pxe_file_url")]
    pxe_base_url: Option<String>,

    /// Full URL PXE clients download the ISO from
    #[arg(long)]
    pxe_file_url: Option<String>,

    /// Also write a PXE artifacts tree here
    #[arg(long)]
    pxe_dir: Option<PathBuf>,
}

impl IsoArgs {
    /// Options file values overridden by flags.
    fn resolve(&self) -> Result<CustomizationOptions> {
        let mut options = match &self.config {
            Some(path) => CustomizationOptions::load(path)?,
            None => CustomizationOptions::default(),
        };

        if let Some(dir) = &self.output_dir {
            options.output_dir = dir.clone();
        }
        if options.output_dir.as_os_str().is_empty() {
            options.output_dir = PathBuf::from("out");
        }
        if let Some(name) = &self.output_name {
            options.output_base_name = name.clone();
        }
        if options.output_base_name.is_empty() {
            options.output_base_name = "liveos".to_string();
        }
        if let Some(args) = &self.extra_cmdline {
            options.kernel_extra_args = args.trim().to_string();
        }
        if let Some(url) = &self.pxe_base_url {
            options.pxe.iso_image_base_url = url.trim().to_string();
            options.pxe.iso_image_file_url.clear();
        }
        if let Some(url) = &self.pxe_file_url {
            options.pxe.iso_image_file_url = url.trim().to_string();
            options.pxe.iso_image_base_url.clear();
        }
        if let Some(dir) = &self.pxe_dir {
            options.pxe_artifacts_dir = Some(dir.clone());
        }

        options.validate()?;
        Ok(options)
    }

    fn build_config(&self) -> BuildConfig {
        BuildConfig::new(&self.build_dir)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Commands::Build {
            image,
            options: args,
        } => {
            let options = args.resolve()?;
            require_tools(&image)?;
            let output = liveos::create_liveos_iso_from_image(&args.build_config(), &options, &image)?;
            println!("{}", output.display());
        }
        Commands::Rebuild {
            iso,
            regenerate_os,
            options: args,
        } => {
            let options = args.resolve()?;
            preflight::require_root()?;
            preflight::check_required_tools(ISO_BUILD_TOOLS)?;
            let regeneration = if regenerate_os {
                preflight::check_required_tools(DISK_BUILD_TOOLS)?;
                OsRegeneration::Regenerate { hook: None }
            } else {
                OsRegeneration::Keep
            };
            let output =
                liveos::create_liveos_iso_from_iso(&args.build_config(), &options, &iso, regeneration)?;
            println!("{}", output.display());
        }
        Commands::ToDisk {
            iso,
            output,
            build_dir,
        } => {
            preflight::require_root()?;
            preflight::check_required_tools(DISK_BUILD_TOOLS)?;
            let output =
                liveos::create_writeable_image_from_iso(&BuildConfig::new(build_dir), &iso, &output)?;
            println!("{}", output.display());
        }
        Commands::Preflight { strict } => run_preflight(strict)?,
    }

    Ok(())
}

fn require_tools(image: &Path) -> Result<()> {
    preflight::require_root()?;
    preflight::check_required_tools(ISO_BUILD_TOOLS)?;
    if ImageFormat::from_path(image) != ImageFormat::Raw {
        preflight::check_required_tools(IMAGE_CONVERSION_TOOLS)?;
    }
    Ok(())
}

fn run_preflight(strict: bool) -> Result<()> {
    let mut failed = false;

    if preflight::is_root() {
        println!("  [OK] running as root");
    } else {
        println!("  [FAIL] not running as root (loop devices, mounts and chroot need it)");
        failed = true;
    }

    for (title, tools) in [
        ("ISO build", ISO_BUILD_TOOLS),
        ("Disk build", DISK_BUILD_TOOLS),
        ("Image conversion", IMAGE_CONVERSION_TOOLS),
    ] {
        println!("{}:", title);
        let missing = preflight::missing_tools(tools);
        for (tool, package) in tools {
            if missing.iter().any(|(m, _)| m == tool) {
                println!("  [FAIL] {} (install: {})", tool, package);
            } else {
                println!("  [OK] {}", tool);
            }
        }
        failed |= !missing.is_empty();
    }

    if failed && strict {
        anyhow::bail!("preflight checks failed");
    }
    Ok(())
}
