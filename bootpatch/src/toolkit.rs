// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Invocation of the external boot image toolkit (magiskboot). The toolkit is
//! opaque: all that matters is the argv, the environment, the exit code and
//! whatever it prints.

use std::{
    ffi::OsString,
    fmt,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{config::ToolkitEnv, workspace::Workspace};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create output pipe for: {0:?}")]
    Pipe(PathBuf, #[source] io::Error),
    #[error("Failed to spawn toolkit: {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Failed to read toolkit output: {0:?}")]
    Output(PathBuf, #[source] io::Error),
    #[error("Failed to wait for toolkit: {0:?}")]
    Wait(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The result of a single toolkit call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Process exit code. A process killed by a signal reports `-1`.
    pub code: i32,
    /// stdout and stderr, interleaved as the process wrote them.
    pub output: String,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait Toolkit {
    /// Run the toolkit with `args` inside `workspace`. The process environment
    /// consists of `env` only. A nonzero exit code is not an error.
    fn run(
        &self,
        workspace: &Workspace,
        env: &ToolkitEnv,
        args: &[OsString],
    ) -> Result<Invocation>;
}

/// Shell-ish rendering of an argv for log messages.
struct DisplayArgs<'a>(&'a Path, &'a [OsString]);

impl fmt::Display for DisplayArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())?;

        for arg in self.1 {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }

        Ok(())
    }
}

/// The real magiskboot executable.
pub struct MagiskBoot {
    program: PathBuf,
}

impl MagiskBoot {
    #[cfg(windows)]
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    /// Create an invoker for the executable at `program`. A path with more than
    /// one component is made absolute since the toolkit runs with the workspace
    /// as its working directory. A bare name is looked up in `PATH`.
    pub fn new(program: &Path) -> Self {
        let program = if program.components().count() > 1 {
            std::path::absolute(program).unwrap_or_else(|_| program.to_owned())
        } else {
            program.to_owned()
        };

        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Toolkit for MagiskBoot {
    fn run(
        &self,
        workspace: &Workspace,
        env: &ToolkitEnv,
        args: &[OsString],
    ) -> Result<Invocation> {
        debug!("Running: {}", DisplayArgs(&self.program, args));

        let (mut reader, writer) = io::pipe().map_err(|e| Error::Pipe(self.program.clone(), e))?;
        let writer_stderr = writer
            .try_clone()
            .map_err(|e| Error::Pipe(self.program.clone(), e))?;

        let mut command = Command::new(&self.program);
        command.args(args);
        command.current_dir(workspace.path());
        command.env_clear();
        command.envs(env.iter().copied());
        command.stdin(Stdio::null());
        command.stdout(writer);
        command.stderr(writer_stderr);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;

            command.creation_flags(Self::CREATE_NO_WINDOW);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(self.program.clone(), e))?;

        // The command still holds the write ends of the pipe. They must be
        // closed before reading or EOF is never reached.
        drop(command);

        let mut output = vec![];
        let read_result = reader.read_to_end(&mut output);
        let status = child
            .wait()
            .map_err(|e| Error::Wait(self.program.clone(), e))?;
        read_result.map_err(|e| Error::Output(self.program.clone(), e))?;

        let invocation = Invocation {
            code: status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output).into_owned(),
        };

        debug!("Exit code: {}", invocation.code);
        for line in invocation.output.lines() {
            trace!("> {line}");
        }

        Ok(invocation)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use crate::config::PatchConfig;

    use super::*;

    fn sh(script: &str, env: &ToolkitEnv) -> (TempDir, Invocation) {
        let temp_dir = TempDir::new().unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();
        let toolkit = MagiskBoot::new(Path::new("/bin/sh"));

        let invocation = toolkit
            .run(&workspace, env, &["-c".into(), script.into()])
            .unwrap();

        (temp_dir, invocation)
    }

    #[test]
    fn merged_output_and_exit_code() {
        let env = PatchConfig::default().env();
        let (_temp_dir, invocation) = sh("echo out; echo err >&2; exit 3", &env);

        assert_eq!(invocation.code, 3);
        assert!(!invocation.success());
        assert!(invocation.output.contains("out\n"));
        assert!(invocation.output.contains("err\n"));
    }

    #[test]
    fn environment_is_exactly_the_flags() {
        let config = PatchConfig {
            keep_verity: false,
            legacy_sar: true,
            ..Default::default()
        };
        let (_temp_dir, invocation) = sh(
            "printf '%s,%s,%s,%s,%s,%s' \"$KEEPVERITY\" \"$KEEPFORCEENCRYPT\" \
                \"$PATCHVBMETAFLAG\" \"$RECOVERYMODE\" \"$LEGACYSAR\" \"${HOME:-unset}\"",
            &config.env(),
        );

        assert!(invocation.success());
        assert_eq!(invocation.output, "flase,true,flase,flase,true,unset");
    }

    #[test]
    fn runs_inside_workspace() {
        let env = PatchConfig::default().env();
        let (temp_dir, invocation) = sh("echo data > ramdisk.cpio", &env);

        assert!(invocation.success());
        assert!(temp_dir.path().join("ramdisk.cpio").exists());
    }

    #[test]
    fn missing_program() {
        let temp_dir = TempDir::new().unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();
        let toolkit = MagiskBoot::new(&temp_dir.path().join("bin/magiskboot"));

        let result = toolkit.run(&workspace, &PatchConfig::default().env(), &[]);
        assert_matches!(result, Err(Error::Spawn(_, _)));
    }
}
