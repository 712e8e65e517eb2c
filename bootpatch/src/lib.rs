/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! bootpatch is primarily an application. The semver versioning covers the CLI
//! only and the Rust APIs can change at any time.
//!
//! The library side is split so that the patching logic never touches the
//! process environment: the workspace root, the toolkit and the host platform
//! are all passed in explicitly.

pub mod cli;
pub mod config;
pub mod patch;
pub mod payload;
pub mod stream;
pub mod toolkit;
pub mod util;
pub mod workspace;
