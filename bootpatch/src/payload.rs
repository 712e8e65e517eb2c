// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of the Magisk binaries from the Magisk APK into the workspace.

use std::{
    env, fmt,
    fs::File,
    io::{self, BufReader, Read, Seek},
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;
use tracing::{debug, warn};
use zip::{ZipArchive, result::ZipError};

use crate::{
    util::NumBytes,
    workspace::{self, Workspace},
};

/// Workspace names of the staged payloads.
pub const STUB: &str = "stub.apk";
pub const MAGISK32: &str = "magisk32";
pub const MAGISK64: &str = "magisk64";
pub const MAGISKINIT: &str = "magiskinit";
/// Where a host-native magiskboot is staged.
pub const TOOLKIT: &str = "bin/magiskboot";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown architecture: {0:?}")]
    UnknownArch(String),
    #[error("Zip error")]
    Zip(#[source] ZipError),
    #[error("Zip error for entry name: {0:?}")]
    ZipEntryName(String, #[source] ZipError),
    #[error("Zip error for entry index #{0}")]
    ZipEntryIndex(usize, #[source] ZipError),
    #[error("Failed to read zip entry: {0:?}")]
    ZipEntryRead(String, #[source] io::Error),
    #[error("Workspace error")]
    Workspace(#[from] workspace::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Target device architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    Arm,
    X86,
    X86_64,
}

impl Arch {
    pub const ALL: [Self; 4] = [Self::Arm64, Self::Arm, Self::X86, Self::X86_64];

    pub fn name(self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    /// Android ABI directory name under `lib/` in the APK.
    pub fn abi(self) -> &'static str {
        match self {
            Self::Arm64 => "arm64-v8a",
            Self::Arm => "armeabi-v7a",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    /// ABI of the 32-bit counterpart. 32-bit architectures map to themselves.
    pub fn abi_32(self) -> &'static str {
        match self {
            Self::Arm64 | Self::Arm => Self::Arm.abi(),
            Self::X86_64 | Self::X86 => Self::X86.abi(),
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, Self::Arm64 | Self::X86_64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s || a.abi() == s)
            .ok_or_else(|| Error::UnknownArch(s.to_owned()))
    }
}

/// The machine running the patcher. This decides whether a native magiskboot
/// is extracted from the APK and which one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPlatform {
    pub windows: bool,
    pub abi: &'static str,
}

impl HostPlatform {
    /// `os` and `arch` use the naming of [`env::consts::OS`] and
    /// [`env::consts::ARCH`]. Unknown processors fall back to x86_64.
    pub fn new(os: &str, arch: &str) -> Self {
        let abi = match arch {
            "aarch64" => Arch::Arm64.abi(),
            "arm" => Arch::Arm.abi(),
            _ => Arch::X86_64.abi(),
        };

        Self {
            windows: os == "windows",
            abi,
        }
    }

    pub fn current() -> Self {
        Self::new(env::consts::OS, env::consts::ARCH)
    }

    /// APK entry of the magiskboot build that runs on this host, if the host
    /// can use one.
    fn toolkit_entry(&self) -> Option<String> {
        (!self.windows).then(|| format!("lib/{}/libmagiskboot.so", self.abi))
    }
}

/// Which payloads ended up in the workspace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagedPayloads {
    pub stub: bool,
    pub toolkit: bool,
    pub magisk32: bool,
    pub magisk64: bool,
    pub magiskinit: bool,
}

/// Read an entry by its full path. Returns [`None`] if there is no such entry.
fn read_entry_by_name<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match zip.by_name(name) {
        Ok(e) => e,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(Error::ZipEntryName(name.to_owned(), e)),
    };
    let mut data = vec![];
    entry
        .read_to_end(&mut data)
        .map_err(|e| Error::ZipEntryRead(name.to_owned(), e))?;

    Ok(Some(data))
}

fn stage(workspace: &Workspace, name: &str, source: &str, data: &[u8]) -> Result<()> {
    debug!("Staging {source:?} as {name:?}: {:?}", NumBytes(data.len()));
    workspace.write(name, data)?;
    Ok(())
}

/// Stage `source` as `name` if the APK contains it. Every payload is optional,
/// so a missing entry is only a warning.
fn stage_by_name<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    workspace: &Workspace,
    name: &str,
    source: &str,
) -> Result<bool> {
    match read_entry_by_name(zip, source)? {
        Some(data) => {
            stage(workspace, name, source, &data)?;
            Ok(true)
        }
        None => {
            warn!("Magisk APK has no {source:?}; not staging {name:?}");
            Ok(false)
        }
    }
}

/// Extract the payloads for `arch` from an opened Magisk APK into `workspace`.
/// Existing files with the same names are overwritten.
pub fn select_payload_from<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    arch: Arch,
    host: &HostPlatform,
    workspace: &Workspace,
) -> Result<StagedPayloads> {
    let toolkit_entry = host.toolkit_entry();
    let init_entry = format!("lib/{}/libmagiskinit.so", arch.abi());
    let mut staged = StagedPayloads::default();

    debug!("Selecting payloads for {arch} on {host:?}");

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::ZipEntryIndex(index, e))?;
        let name = entry.name().to_owned();

        // Magisk 26.0+.
        let is_stub = name.contains(STUB);
        let is_toolkit = toolkit_entry
            .as_ref()
            .is_some_and(|e| name.contains(e.as_str()));
        let is_init = name.contains(&init_entry);

        if !is_stub && !is_toolkit && !is_init {
            continue;
        }

        let mut data = vec![];
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::ZipEntryRead(name.clone(), e))?;
        drop(entry);

        if is_stub {
            stage(workspace, STUB, &name, &data)?;
            staged.stub = true;
        }

        if is_toolkit {
            debug!("Staging {name:?} as {TOOLKIT:?}: {:?}", NumBytes(data.len()));
            workspace.write_executable(TOOLKIT, &data)?;
            staged.toolkit = true;
        }

        if is_init {
            let magisk32 = format!("lib/{}/libmagisk32.so", arch.abi_32());
            staged.magisk32 = stage_by_name(zip, workspace, MAGISK32, &magisk32)?;

            if arch.is_64bit() {
                let magisk64 = format!("lib/{}/libmagisk64.so", arch.abi());
                staged.magisk64 = stage_by_name(zip, workspace, MAGISK64, &magisk64)?;
            }

            stage(workspace, MAGISKINIT, &name, &data)?;
            staged.magiskinit = true;
        }
    }

    Ok(staged)
}

/// Extract the payloads for `arch` from the Magisk APK at `path`.
pub fn select_payload(
    path: &Path,
    arch: Arch,
    host: &HostPlatform,
    workspace: &Workspace,
) -> Result<StagedPayloads> {
    let reader = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    let mut zip = ZipArchive::new(BufReader::new(reader)).map_err(Error::Zip)?;

    select_payload_from(&mut zip, arch, host, workspace)
}
