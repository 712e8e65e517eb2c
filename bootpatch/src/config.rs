// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value used for enabled flags in both the toolkit environment and the
/// Magisk config record.
pub const TOKEN_TRUE: &str = "true";
/// Value used for disabled flags. Consumers only ever compare against
/// [`TOKEN_TRUE`].
pub const TOKEN_FALSE: &str = "flase";

pub const KEY_KEEP_VERITY: &str = "KEEPVERITY";
pub const KEY_KEEP_FORCE_ENCRYPT: &str = "KEEPFORCEENCRYPT";
pub const KEY_PATCH_VBMETA_FLAG: &str = "PATCHVBMETAFLAG";
pub const KEY_RECOVERY_MODE: &str = "RECOVERYMODE";
pub const KEY_LEGACY_SAR: &str = "LEGACYSAR";
pub const KEY_SHA1: &str = "SHA1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    File(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub fn bool_token(value: bool) -> &'static str {
    if value { TOKEN_TRUE } else { TOKEN_FALSE }
}

/// The environment passed to every toolkit invocation, in a fixed order.
pub type ToolkitEnv = [(&'static str, &'static str); 5];

/// Options controlling how a boot image is patched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchConfig {
    /// Keep dm-verity enabled.
    pub keep_verity: bool,
    /// Keep forced encryption enabled.
    pub keep_force_encrypt: bool,
    /// Patch the vbmeta flags in the boot image header.
    pub patch_vbmeta_flag: bool,
    /// Patch a recovery image instead of a boot image.
    pub recovery_mode: bool,
    /// Device uses the legacy system-as-root layout.
    pub legacy_sar: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            keep_verity: true,
            keep_force_encrypt: true,
            patch_vbmeta_flag: false,
            recovery_mode: false,
            legacy_sar: false,
        }
    }
}

impl PatchConfig {
    /// Load the config from a TOML file. Keys that are not present take their
    /// default values.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::File(path.to_owned(), e))?;
        let config = toml_edit::de::from_str(&data).map_err(|e| Error::Parse(path.to_owned(), e))?;

        Ok(config)
    }

    pub fn env(&self) -> ToolkitEnv {
        [
            (KEY_KEEP_VERITY, bool_token(self.keep_verity)),
            (KEY_KEEP_FORCE_ENCRYPT, bool_token(self.keep_force_encrypt)),
            (KEY_PATCH_VBMETA_FLAG, bool_token(self.patch_vbmeta_flag)),
            (KEY_RECOVERY_MODE, bool_token(self.recovery_mode)),
            (KEY_LEGACY_SAR, bool_token(self.legacy_sar)),
        ]
    }

    /// Build the record that gets embedded in the ramdisk as `.backup/.magisk`.
    pub fn record(&self, sha1: Option<String>) -> ConfigRecord {
        ConfigRecord {
            keep_verity: self.keep_verity,
            keep_force_encrypt: self.keep_force_encrypt,
            recovery_mode: self.recovery_mode,
            sha1,
        }
    }
}

/// Find the value of `key` in newline-separated `KEY=VALUE` text.
pub fn get_prop<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim_end())
}

/// Magisk's config record. Serializes to `KEY=VALUE` lines in a fixed order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigRecord {
    pub keep_verity: bool,
    pub keep_force_encrypt: bool,
    pub recovery_mode: bool,
    /// SHA-1 of the stock boot image, if known.
    pub sha1: Option<String>,
}

impl fmt::Display for ConfigRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{KEY_KEEP_VERITY}={}", bool_token(self.keep_verity))?;
        writeln!(
            f,
            "{KEY_KEEP_FORCE_ENCRYPT}={}",
            bool_token(self.keep_force_encrypt),
        )?;
        writeln!(f, "{KEY_RECOVERY_MODE}={}", bool_token(self.recovery_mode))?;

        if let Some(sha1) = &self.sha1 {
            writeln!(f, "{KEY_SHA1}={sha1}")?;
        }

        Ok(())
    }
}
