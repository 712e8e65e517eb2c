/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing::Level;

use crate::cli::patch::{self, CleanupCli, ExtractCli, PatchCli};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub fn init_logging(log_level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(log_level))
        .init();
}

/// Generate shell tab completion configs.
#[derive(Debug, Parser)]
pub struct CompletionCli {
    /// The shell to generate completions for.
    #[arg(short, long, value_name = "SHELL", value_parser)]
    pub shell: Shell,
}

fn completion_main(cli: &CompletionCli) -> Result<()> {
    clap_complete::generate(
        cli.shell,
        &mut Cli::command(),
        env!("CARGO_PKG_NAME"),
        &mut io::stdout(),
    );

    Ok(())
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Extract(ExtractCli),
    Patch(PatchCli),
    Cleanup(CleanupCli),
    Completion(CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", value_enum, default_value_t)]
    pub log_level: LogLevel,
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Extract(c) => patch::extract_main(&c),
        Command::Patch(c) => patch::patch_main(&c, cancel_signal),
        Command::Cleanup(c) => patch::cleanup_main(&c),
        Command::Completion(c) => completion_main(&c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_patch_flags() {
        let cli = Cli::try_parse_from([
            "bootpatch",
            "patch",
            "-i",
            "boot.img",
            "-p",
            "Magisk.apk",
            "-a",
            "x86_64",
            "--keep-verity",
            "false",
            "--legacy-sar",
            "true",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, LogLevel::Debug);

        let Command::Patch(patch) = cli.command else {
            panic!("Not a patch command: {:?}", cli.command);
        };
        assert_eq!(patch.arch, crate::payload::Arch::X86_64);
        assert_eq!(patch.flags.keep_verity, Some(false));
        assert_eq!(patch.flags.legacy_sar, Some(true));
        assert_eq!(patch.flags.recovery_mode, None);
    }
}
