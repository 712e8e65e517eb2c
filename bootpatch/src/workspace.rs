// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The working directory shared by payload extraction, the toolkit and the
//! patcher. All names passed to [`Workspace`] methods are relative to the
//! workspace root and cannot escape it.

use std::{
    fs::File,
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use cap_std::{ambient_authority, fs::Dir};
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, trace};

use crate::stream::{self, HashingReader};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open workspace: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("File I/O error in workspace: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Compute the hex-encoded SHA-1 digest of a whole file. This is the
/// fingerprint Magisk stores in its config to find the stock image backup.
pub fn hash_file(path: &Path, cancel_signal: &AtomicBool) -> Result<String> {
    let raw_reader = File::open(path).map_err(|e| Error::File(path.to_owned(), e))?;
    let context = Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
    let mut reader = HashingReader::new(BufReader::new(raw_reader), context);

    stream::copy(&mut reader, io::sink(), cancel_signal)
        .map_err(|e| Error::File(path.to_owned(), e))?;

    let (_, context) = reader.finish();
    let digest = hex::encode(context.finish());

    trace!("SHA-1 of {path:?}: {digest}");

    Ok(digest)
}

pub struct Workspace {
    path: PathBuf,
    dir: Dir,
}

impl Workspace {
    /// Open the workspace directory, creating it if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let authority = ambient_authority();
        Dir::create_ambient_dir_all(path, authority).map_err(|e| Error::Open(path.to_owned(), e))?;
        let dir =
            Dir::open_ambient_dir(path, authority).map_err(|e| Error::Open(path.to_owned(), e))?;
        let path = std::path::absolute(path).map_err(|e| Error::Open(path.to_owned(), e))?;

        Ok(Self { path, dir })
    }

    /// Absolute path to the workspace root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, name: &str, e: io::Error) -> Error {
        Error::File(self.path.join(name), e)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.dir.exists(name)
    }

    pub fn is_file(&self, name: &str) -> bool {
        self.dir.is_file(name)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.dir.read(name).map_err(|e| self.error(name, e))
    }

    pub fn read_to_string(&self, name: &str) -> Result<String> {
        self.dir.read_to_string(name).map_err(|e| self.error(name, e))
    }

    /// Write `data` to `name`, replacing any existing file.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        self.create_parent(name)?;
        self.dir.write(name, data).map_err(|e| self.error(name, e))
    }

    /// Like [`Self::write`], but marks the file as executable (`0755`) on
    /// platforms that have permission bits.
    pub fn write_executable(&self, name: &str, data: &[u8]) -> Result<()> {
        self.create_parent(name)?;

        let mut file = self
            .dir
            .create(name)
            .map_err(|e| self.error(name, e))?
            .into_std();
        file.write_all(data).map_err(|e| self.error(name, e))?;

        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};

            file.set_permissions(Permissions::from_mode(0o755))
                .map_err(|e| self.error(name, e))?;
        }

        Ok(())
    }

    fn create_parent(&self, name: &str) -> Result<()> {
        if let Some(parent) = Path::new(name).parent() {
            if !parent.as_os_str().is_empty() {
                self.dir
                    .create_dir_all(parent)
                    .map_err(|e| self.error(name, e))?;
            }
        }

        Ok(())
    }

    /// Copy `src` to `dest` within the workspace. Nothing happens if `src`
    /// does not exist.
    pub fn copy_if_exists(&self, src: &str, dest: &str) -> Result<()> {
        if !self.dir.is_file(src) {
            trace!("Not copying nonexistent file: {src:?}");
            return Ok(());
        }

        self.dir
            .copy(src, &self.dir, dest)
            .map_err(|e| self.error(dest, e))?;
        debug!("Copied {src:?} to {dest:?}");

        Ok(())
    }

    /// Whether `src` and the workspace file `dest` resolve to the same file.
    fn is_same_file(&self, src: &Path, dest: &str) -> bool {
        match (src.canonicalize(), self.path.join(dest).canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Copy a file from outside the workspace to `dest` within it. Nothing
    /// happens if `src` does not exist or already is `dest`.
    pub fn import_if_exists(&self, src: &Path, dest: &str) -> Result<()> {
        // Truncating dest would wipe src.
        if self.is_same_file(src, dest) {
            trace!("Not copying file onto itself: {src:?}");
            return Ok(());
        }

        let mut reader = match File::open(src) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("Not copying nonexistent file: {src:?}");
                return Ok(());
            }
            Err(e) => return Err(Error::File(src.to_owned(), e)),
        };
        let mut writer = self
            .dir
            .create(dest)
            .map_err(|e| self.error(dest, e))?
            .into_std();

        io::copy(&mut reader, &mut writer).map_err(|e| self.error(dest, e))?;
        debug!("Copied {src:?} to {dest:?}");

        Ok(())
    }

    /// Remove files or directory trees. Paths that don't exist are ignored, so
    /// this is safe to call on a partially populated workspace.
    pub fn remove_if_exists(&self, names: &[&str]) -> Result<()> {
        for name in names {
            let metadata = match self.dir.symlink_metadata(name) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.error(name, e)),
            };

            let result = if metadata.is_dir() {
                self.dir.remove_dir_all(name)
            } else {
                self.dir.remove_file(name)
            };

            match result {
                Ok(()) => trace!("Removed {name:?}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.error(name, e)),
            }
        }

        Ok(())
    }
}
