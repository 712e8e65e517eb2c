/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};

use crate::{
    cli::{status, warning},
    config::PatchConfig,
    patch::{self, BootPatcher},
    payload::{self, Arch, HostPlatform, StagedPayloads},
    toolkit::MagiskBoot,
    workspace::Workspace,
};

#[derive(Debug, Args)]
pub struct WorkspaceGroup {
    /// Working directory for staged payloads and unpacked images.
    #[arg(
        short,
        long,
        value_name = "DIRECTORY",
        value_parser,
        default_value = "."
    )]
    pub work_dir: PathBuf,

    /// Path to the magiskboot executable.
    ///
    /// Defaults to the copy extracted from the Magisk APK into
    /// `<work_dir>/bin/magiskboot`.
    #[arg(long, value_name = "FILE", value_parser)]
    pub toolkit: Option<PathBuf>,
}

impl WorkspaceGroup {
    fn open(&self) -> Result<Workspace> {
        Workspace::open(&self.work_dir)
            .with_context(|| format!("Failed to open workspace: {:?}", self.work_dir))
    }

    fn toolkit(&self, workspace: &Workspace) -> MagiskBoot {
        match &self.toolkit {
            Some(p) => MagiskBoot::new(p),
            None => MagiskBoot::new(&workspace.path().join(payload::TOOLKIT)),
        }
    }
}

#[derive(Debug, Args)]
pub struct FlagsGroup {
    /// TOML file with default values for the patch options below.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Keep dm-verity enabled [default: true].
    #[arg(long, value_name = "BOOL")]
    pub keep_verity: Option<bool>,

    /// Keep forced encryption enabled [default: true].
    #[arg(long, value_name = "BOOL")]
    pub keep_force_encrypt: Option<bool>,

    /// Patch the vbmeta flags in the boot image header [default: false].
    #[arg(long, value_name = "BOOL")]
    pub patch_vbmeta_flag: Option<bool>,

    /// Patch a recovery image [default: false].
    #[arg(long, value_name = "BOOL")]
    pub recovery_mode: Option<bool>,

    /// Apply the legacy system-as-root kernel patch [default: false].
    #[arg(long, value_name = "BOOL")]
    pub legacy_sar: Option<bool>,
}

impl FlagsGroup {
    /// Options from the config file, if any, overridden by the command line.
    fn load(&self) -> Result<PatchConfig> {
        let mut config = match &self.config {
            Some(p) => PatchConfig::load(p)?,
            None => PatchConfig::default(),
        };

        for (value, field) in [
            (self.keep_verity, &mut config.keep_verity),
            (self.keep_force_encrypt, &mut config.keep_force_encrypt),
            (self.patch_vbmeta_flag, &mut config.patch_vbmeta_flag),
            (self.recovery_mode, &mut config.recovery_mode),
            (self.legacy_sar, &mut config.legacy_sar),
        ] {
            if let Some(v) = value {
                *field = v;
            }
        }

        Ok(config)
    }
}

fn extract_payloads(package: &Path, arch: Arch, workspace: &Workspace) -> Result<StagedPayloads> {
    status!("Extracting {arch} payloads from: {package:?}");

    let host = HostPlatform::current();
    let staged = payload::select_payload(package, arch, &host, workspace)
        .with_context(|| format!("Failed to extract payloads: {package:?}"))?;

    if !staged.magiskinit {
        warning!("No magiskinit for {arch} found in: {package:?}");
    }
    if !host.windows && !staged.toolkit {
        warning!("No magiskboot for this host found in: {package:?}");
    }

    Ok(staged)
}

pub fn extract_main(cli: &ExtractCli) -> Result<()> {
    let workspace = cli.workspace.open()?;
    let staged = extract_payloads(&cli.package, cli.arch, &workspace)?;

    println!("{staged:#?}");

    Ok(())
}

pub fn patch_main(cli: &PatchCli, cancel_signal: &AtomicBool) -> Result<()> {
    let start = Instant::now();

    let config = cli.flags.load()?;
    let workspace = cli.workspace.open()?;

    if let Some(package) = &cli.package {
        extract_payloads(package, cli.arch, &workspace)?;
    }

    let toolkit = cli.workspace.toolkit(&workspace);
    if !toolkit.program().is_file() && toolkit.program().components().count() > 1 {
        bail!("magiskboot does not exist: {:?}", toolkit.program());
    }

    let patcher = BootPatcher::new(toolkit, config, workspace);

    status!("Patching boot image: {:?}", cli.input);

    if let Err(e) = patcher.patch(&cli.input, cancel_signal) {
        warning!("Patching failed; cleaning up staged files");

        // The original error is more useful than a cleanup failure.
        if let Err(cleanup_err) = patcher.cleanup() {
            warning!("Failed to clean up workspace: {cleanup_err}");
        }

        return Err(e).with_context(|| format!("Failed to patch boot image: {:?}", cli.input));
    }

    let new_image = patcher.workspace().path().join(patch::NEW_BOOT_IMAGE);

    if let Some(output) = &cli.output {
        fs::copy(&new_image, output)
            .with_context(|| format!("Failed to copy {new_image:?} to {output:?}"))?;
        fs::remove_file(&new_image)
            .with_context(|| format!("Failed to remove {new_image:?}"))?;

        status!("Patched image written to: {output:?}");
    } else {
        status!("Patched image written to: {new_image:?}");
    }

    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

pub fn cleanup_main(cli: &CleanupCli) -> Result<()> {
    let workspace = cli.workspace.open()?;
    let toolkit = cli.workspace.toolkit(&workspace);
    let patcher = BootPatcher::new(toolkit, PatchConfig::default(), workspace);

    patcher
        .cleanup()
        .with_context(|| format!("Failed to clean up workspace: {:?}", cli.workspace.work_dir))
}

/// Extract the Magisk payloads for a device from the Magisk APK.
///
/// This stages magiskinit, magisk32, magisk64 and the stub APK in the working
/// directory. On hosts other than Windows, a native magiskboot is also
/// extracted to `bin/magiskboot`.
#[derive(Debug, Parser)]
pub struct ExtractCli {
    /// Path to the Magisk APK.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub package: PathBuf,

    /// Device architecture (arm64, arm, x86, x86_64).
    #[arg(short, long, value_name = "ARCH", default_value = "arm64")]
    pub arch: Arch,

    #[command(flatten)]
    pub workspace: WorkspaceGroup,
}

/// Root a boot image with Magisk.
///
/// If a Magisk APK is given, its payloads are extracted first. Otherwise, the
/// payloads must already be staged in the working directory.
#[derive(Debug, Parser)]
pub struct PatchCli {
    /// Path to the boot image to patch.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path for the patched boot image.
    ///
    /// Defaults to `new-boot.img` in the working directory.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,

    /// Path to the Magisk APK.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub package: Option<PathBuf>,

    /// Device architecture (arm64, arm, x86, x86_64).
    #[arg(short, long, value_name = "ARCH", default_value = "arm64")]
    pub arch: Arch,

    #[command(flatten)]
    pub workspace: WorkspaceGroup,

    #[command(flatten)]
    pub flags: FlagsGroup,
}

/// Remove staged payloads and unpacked files from the working directory.
///
/// `stock_boot.img` is kept.
#[derive(Debug, Parser)]
pub struct CleanupCli {
    #[command(flatten)]
    pub workspace: WorkspaceGroup,
}
