// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Root a boot image with Magisk by driving magiskboot.
//!
//! The patcher never looks inside the image itself. Every decision is made from
//! toolkit exit codes and from which files exist in the workspace after each
//! step.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{self, PatchConfig},
    payload,
    toolkit::{self, Invocation, Toolkit},
    workspace::{self, Workspace},
};

pub const STOCK_BOOT_IMAGE: &str = "stock_boot.img";
/// Written by the toolkit on repack.
pub const NEW_BOOT_IMAGE: &str = "new-boot.img";
pub const RAMDISK: &str = "ramdisk.cpio";
pub const RAMDISK_ORIG: &str = "ramdisk.cpio.orig";
pub const CONFIG: &str = "config";
pub const CONFIG_ORIG: &str = "config.orig";
pub const KERNEL: &str = "kernel";
pub const DTB_NAMES: [&str; 3] = ["dtb", "kernel_dtb", "extra"];

const MAGISK32_XZ: &str = "magisk32.xz";
const MAGISK64_XZ: &str = "magisk64.xz";
const STUB_XZ: &str = "stub.xz";

/// Staging files that only live between the ramdisk edit and its success.
const RAMDISK_STAGING: &[&str] = &[RAMDISK_ORIG, CONFIG, MAGISK32_XZ, MAGISK64_XZ, STUB_XZ];

/// Everything [`BootPatcher::cleanup`] removes. `stock_boot.img` is kept.
/// The staging files are only left over when a run failed part way.
pub const CLEANUP_FILES: &[&str] = &[
    payload::MAGISK32,
    MAGISK32_XZ,
    payload::MAGISK64,
    MAGISK64_XZ,
    payload::MAGISKINIT,
    payload::STUB,
    STUB_XZ,
    RAMDISK_ORIG,
    CONFIG,
    CONFIG_ORIG,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Boot image does not exist: {0:?}")]
    MissingInput(PathBuf),
    #[error("Unsupported or unknown boot image format")]
    UnsupportedFormat,
    #[error("ChromeOS boot images are not supported")]
    ChromeOsFormatUnsupported,
    #[error("Failed to unpack boot image (exit code {0})")]
    UnpackFailed(i32),
    #[error(
        "Boot image was modified by an unknown program; restore the stock boot image and try again"
    )]
    ForeignModification,
    #[error("Failed to patch ramdisk (exit code {0})")]
    RamdiskPatchFailed(i32),
    #[error(
        "{0} in the boot image was patched by an incompatible Magisk version; use an unmodified boot image"
    )]
    ForeignDtbModification(&'static str),
    #[error("Failed to repack boot image (exit code {0})")]
    RepackFailed(i32),
    #[error("Received cancel signal")]
    Cancelled,
    #[error("Toolkit error")]
    Toolkit(#[from] toolkit::Error),
    #[error("Workspace error")]
    Workspace(#[from] workspace::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// What the ramdisk says about the image's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RamdiskState {
    Stock,
    PreviouslyPatched,
    UnsupportedModification,
    /// The image has no ramdisk. Patched like a stock image, but there is
    /// nothing to back up.
    Absent,
}

/// Decoded exit code of `magiskboot cpio <ramdisk> test`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamdiskStatus {
    pub state: RamdiskState,
    /// The device's real init lives at `init.real`. Sony devices do this.
    pub sony_init: bool,
}

impl RamdiskStatus {
    /// Bits 0-1: 0 = stock, 1 = patched by Magisk, 2 = patched by something
    /// else. 3 is never produced and is treated as 2.
    const CLASS_MASK: i32 = 0b011;
    /// Bit 2: init is named `init.real`.
    const SONY_INIT_BIT: i32 = 0b100;

    pub fn from_code(code: i32) -> Self {
        let state = match code & Self::CLASS_MASK {
            0 => RamdiskState::Stock,
            1 => RamdiskState::PreviouslyPatched,
            _ => RamdiskState::UnsupportedModification,
        };

        Self {
            state,
            sony_init: code & Self::SONY_INIT_BIT != 0,
        }
    }

    pub fn absent() -> Self {
        Self {
            state: RamdiskState::Absent,
            sony_init: false,
        }
    }

    /// Ramdisk path that magiskinit replaces.
    pub fn init_path(&self) -> &'static str {
        if self.sony_init { "init.real" } else { "init" }
    }
}

/// One sub-command of `magiskboot cpio`. Each is passed as a separate argv
/// element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpioCommand {
    Add {
        mode: u32,
        path: &'static str,
        source: &'static str,
    },
    Mkdir {
        mode: u32,
        path: &'static str,
    },
    Extract {
        path: &'static str,
        dest: &'static str,
    },
    Backup {
        orig: &'static str,
    },
    Restore,
    Patch,
    /// Placeholder for a conditional command whose input does not exist.
    /// magiskboot skips arguments starting with `#`.
    NoOp,
}

impl CpioCommand {
    /// `command` if `condition` holds, otherwise [`Self::NoOp`].
    fn when(condition: bool, command: Self) -> Self {
        if condition { command } else { Self::NoOp }
    }
}

impl fmt::Display for CpioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { mode, path, source } => write!(f, "add {mode:04o} {path} {source}"),
            Self::Mkdir { mode, path } => write!(f, "mkdir {mode:04o} {path}"),
            Self::Extract { path, dest } => write!(f, "extract {path} {dest}"),
            Self::Backup { orig } => write!(f, "backup {orig}"),
            Self::Restore => f.write_str("restore"),
            Self::Patch => f.write_str("patch"),
            Self::NoOp => f.write_str("#"),
        }
    }
}

/// A signature/replacement pair for `magiskboot hexpatch`.
#[derive(Clone, Copy, Debug)]
pub struct KernelPatch {
    pub name: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Samsung RKP (real-time kernel protection) checks.
pub const KERNEL_PATCH_RKP: KernelPatch = KernelPatch {
    name: "RKP",
    from: "49010054011440B93FA00F71E9000054010840B93FA00F7189000054001840B91FA00F7188010054",
    to: "A1020054011440B93FA00F7140020054010840B93FA00F71E0010054001840B91FA00F7181010054",
};

/// Samsung defex (defeat exploit) UID check.
pub const KERNEL_PATCH_DEFEX: KernelPatch = KernelPatch {
    name: "defex",
    from: "821B8012",
    to: "E2FF8F12",
};

/// `skip_initramfs` -> `want_initramfs` for legacy system-as-root devices.
pub const KERNEL_PATCH_LEGACY_SAR: KernelPatch = KernelPatch {
    name: "legacy SAR",
    from: "736B69705F696E697472616D667300",
    to: "77616E745F696E697472616D667300",
};

/// Which optional payloads made it into the ramdisk.
#[derive(Clone, Copy, Debug, Default)]
struct CompressedPayloads {
    magisk32: bool,
    magisk64: bool,
    stub: bool,
}

/// Build the single composite ramdisk edit. The conditional magisk32/magisk64
/// entries keep their slots as no-ops so the command list always has the same
/// shape.
pub fn ramdisk_commands(
    status: RamdiskStatus,
    magisk32: bool,
    magisk64: bool,
    stub: bool,
) -> Vec<CpioCommand> {
    let mut commands = vec![
        CpioCommand::Add {
            mode: 0o750,
            path: status.init_path(),
            source: payload::MAGISKINIT,
        },
        CpioCommand::Mkdir {
            mode: 0o750,
            path: "overlay.d",
        },
        CpioCommand::Mkdir {
            mode: 0o750,
            path: "overlay.d/sbin",
        },
        CpioCommand::when(
            magisk32,
            CpioCommand::Add {
                mode: 0o644,
                path: "overlay.d/sbin/magisk32.xz",
                source: MAGISK32_XZ,
            },
        ),
        CpioCommand::when(
            magisk64,
            CpioCommand::Add {
                mode: 0o644,
                path: "overlay.d/sbin/magisk64.xz",
                source: MAGISK64_XZ,
            },
        ),
    ];

    if stub {
        commands.push(CpioCommand::Add {
            mode: 0o644,
            path: "overlay.d/sbin/stub.xz",
            source: STUB_XZ,
        });
    }

    commands.extend([
        CpioCommand::Patch,
        CpioCommand::when(
            status.state != RamdiskState::Absent,
            CpioCommand::Backup { orig: RAMDISK_ORIG },
        ),
        CpioCommand::Mkdir {
            mode: 0o000,
            path: ".backup",
        },
        CpioCommand::Add {
            mode: 0o000,
            path: ".backup/.magisk",
            source: CONFIG,
        },
    ]);

    commands
}

fn check_cancel(cancel_signal: &AtomicBool) -> Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }

    Ok(())
}

/// Patches boot images in a workspace using an external toolkit.
pub struct BootPatcher<T> {
    toolkit: T,
    config: PatchConfig,
    workspace: Workspace,
}

impl<T: Toolkit> BootPatcher<T> {
    pub fn new(toolkit: T, config: PatchConfig, workspace: Workspace) -> Self {
        Self {
            toolkit,
            config,
            workspace,
        }
    }

    pub fn toolkit(&self) -> &T {
        &self.toolkit
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn exec<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<Invocation> {
        let args = args
            .iter()
            .map(|a| a.as_ref().to_owned())
            .collect::<Vec<OsString>>();

        Ok(self
            .toolkit
            .run(&self.workspace, &self.config.env(), &args)?)
    }

    fn unpack(&self, image: &Path) -> Result<()> {
        info!("Unpacking boot image");

        let result = self.exec(&[OsStr::new("unpack"), image.as_os_str()])?;

        match result.code {
            0 => Ok(()),
            1 => Err(Error::UnsupportedFormat),
            2 => Err(Error::ChromeOsFormatUnsupported),
            code => Err(Error::UnpackFailed(code)),
        }
    }

    fn ramdisk_status(&self) -> Result<RamdiskStatus> {
        info!("Checking ramdisk status");

        if !self.workspace.is_file(RAMDISK) {
            debug!("Boot image has no ramdisk");
            return Ok(RamdiskStatus::absent());
        }

        let result = self.exec(&["cpio", RAMDISK, "test"])?;
        let status = RamdiskStatus::from_code(result.code);
        debug!("Ramdisk status {}: {status:?}", result.code);

        Ok(status)
    }

    /// Handle the ramdisk state. Returns the stock image SHA-1 if it is known
    /// at this point.
    fn back_up(
        &self,
        image: &Path,
        status: RamdiskStatus,
        cancel_signal: &AtomicBool,
    ) -> Result<Option<String>> {
        match status.state {
            RamdiskState::Stock | RamdiskState::Absent => {
                info!("Stock boot image detected");

                let sha1 = workspace::hash_file(image, cancel_signal)?;
                self.workspace.import_if_exists(image, STOCK_BOOT_IMAGE)?;
                self.workspace.copy_if_exists(RAMDISK, RAMDISK_ORIG)?;

                Ok(Some(sha1))
            }
            RamdiskState::PreviouslyPatched => {
                info!("Boot image was previously patched by Magisk");

                let extract = CpioCommand::Extract {
                    path: ".backup/.magisk",
                    dest: CONFIG_ORIG,
                };
                let result = self.exec(&[
                    "cpio".to_owned(),
                    RAMDISK.to_owned(),
                    extract.to_string(),
                    CpioCommand::Restore.to_string(),
                ])?;
                if !result.success() {
                    warn!("Failed to restore stock ramdisk (exit code {})", result.code);
                }

                self.workspace.copy_if_exists(RAMDISK, RAMDISK_ORIG)?;
                // A patched image is not a stock backup.
                self.workspace.remove_if_exists(&[STOCK_BOOT_IMAGE])?;

                Ok(None)
            }
            RamdiskState::UnsupportedModification => Err(Error::ForeignModification),
        }
    }

    /// Take the stock image SHA-1 from the previous patch's config, if there
    /// was one.
    fn recover_sha1(&self, sha1: Option<String>) -> Result<Option<String>> {
        if !self.workspace.is_file(CONFIG_ORIG) {
            return Ok(sha1);
        }

        let data = self.workspace.read_to_string(CONFIG_ORIG)?;
        let recovered = config::get_prop(&data, config::KEY_SHA1)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_owned());
        debug!("SHA-1 from previous config: {recovered:?}");

        self.workspace.remove_if_exists(&[CONFIG_ORIG])?;

        Ok(recovered.or(sha1))
    }

    fn compress_payloads(&self) -> Result<CompressedPayloads> {
        let mut compressed = CompressedPayloads::default();

        for (source, target, present) in [
            (payload::MAGISK64, MAGISK64_XZ, &mut compressed.magisk64),
            (payload::MAGISK32, MAGISK32_XZ, &mut compressed.magisk32),
            (payload::STUB, STUB_XZ, &mut compressed.stub),
        ] {
            if !self.workspace.is_file(source) {
                debug!("Payload not staged: {source:?}");
                continue;
            }

            let result = self.exec(&["compress=xz", source, target])?;
            if !result.success() {
                warn!("Failed to compress {source:?} (exit code {})", result.code);
            }

            *present = true;
        }

        trace!("Compressed payloads: {compressed:?}");

        Ok(compressed)
    }

    fn patch_ramdisk(&self, status: RamdiskStatus, sha1: Option<String>) -> Result<()> {
        info!("Patching ramdisk");

        let compressed = self.compress_payloads()?;

        let record = self.config.record(sha1);
        trace!("Magisk config: {:?}", record.to_string());
        self.workspace.write(CONFIG, record.to_string().as_bytes())?;

        let commands = ramdisk_commands(
            status,
            compressed.magisk32,
            compressed.magisk64,
            compressed.stub,
        );
        let mut args = vec!["cpio".to_owned(), RAMDISK.to_owned()];
        args.extend(commands.iter().map(|c| c.to_string()));

        let result = self.exec(&args)?;
        if !result.success() {
            return Err(Error::RamdiskPatchFailed(result.code));
        }

        self.workspace.remove_if_exists(RAMDISK_STAGING)?;

        Ok(())
    }

    fn patch_dtbs(&self) -> Result<()> {
        for name in DTB_NAMES {
            if !self.workspace.is_file(name) {
                continue;
            }

            let result = self.exec(&["dtb", name, "test"])?;
            if !result.success() {
                return Err(Error::ForeignDtbModification(name));
            }

            let result = self.exec(&["dtb", name, "patch"])?;
            if result.success() {
                info!("Patched fstab in {name}");
            } else {
                debug!("No fstab changes in {name} (exit code {})", result.code);
            }
        }

        Ok(())
    }

    /// Apply the kernel hex patches. If none of them match, the kernel is
    /// dropped from the workspace so that the original is repacked as-is.
    fn patch_kernel(&self) -> Result<()> {
        if !self.workspace.is_file(KERNEL) {
            return Ok(());
        }

        let mut patches = vec![KERNEL_PATCH_RKP, KERNEL_PATCH_DEFEX];
        if self.config.legacy_sar {
            patches.push(KERNEL_PATCH_LEGACY_SAR);
        }

        let mut patched = false;

        for patch in patches {
            let result = self.exec(&["hexpatch", KERNEL, patch.from, patch.to])?;
            if result.success() {
                info!("Applied {} kernel patch", patch.name);
                patched = true;
            } else {
                debug!("{} kernel patch did not match", patch.name);
            }
        }

        if !patched {
            debug!("Kernel unchanged; not repacking it");
            self.workspace.remove_if_exists(&[KERNEL])?;
        }

        Ok(())
    }

    fn repack(&self, image: &Path) -> Result<()> {
        info!("Repacking boot image");

        let result = self.exec(&[OsStr::new("repack"), image.as_os_str()])?;
        if !result.success() {
            return Err(Error::RepackFailed(result.code));
        }

        Ok(())
    }

    /// Patch `image`. On success, the patched image is written to
    /// [`NEW_BOOT_IMAGE`] in the workspace and the staged payloads are cleaned
    /// up. On failure, the workspace is left as-is for inspection and the
    /// caller should run [`Self::cleanup`].
    pub fn patch(&self, image: &Path, cancel_signal: &AtomicBool) -> Result<()> {
        if !image.is_file() {
            return Err(Error::MissingInput(image.to_owned()));
        }

        // The toolkit runs inside the workspace.
        let image = std::path::absolute(image)
            .map_err(|e| workspace::Error::File(image.to_owned(), e))?;

        self.unpack(&image)?;
        check_cancel(cancel_signal)?;

        let status = self.ramdisk_status()?;
        let sha1 = self.back_up(&image, status, cancel_signal)?;
        let sha1 = self.recover_sha1(sha1)?;
        check_cancel(cancel_signal)?;

        self.patch_ramdisk(status, sha1)?;
        check_cancel(cancel_signal)?;

        self.patch_dtbs()?;
        self.patch_kernel()?;
        check_cancel(cancel_signal)?;

        self.repack(&image)?;

        self.cleanup()?;
        info!("Boot image patched successfully");

        Ok(())
    }

    /// Remove staged payloads and let the toolkit remove its unpacked files.
    pub fn cleanup(&self) -> Result<()> {
        info!("Cleaning up workspace");

        self.workspace.remove_if_exists(CLEANUP_FILES)?;

        let result = self.exec(&["cleanup"])?;
        if !result.success() {
            warn!("Toolkit cleanup failed (exit code {})", result.code);
        }

        Ok(())
    }
}
