// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{Cursor, Write},
};

use assert_matches::assert_matches;
use bootpatch::{
    payload::{self, Arch, Error, HostPlatform, StagedPayloads},
    workspace::Workspace,
};
use tempfile::TempDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Entries of a Magisk 26+ APK that matter for patching, plus some noise.
const APK_ENTRIES: &[&str] = &[
    "AndroidManifest.xml",
    "assets/stub.apk",
    "classes.dex",
    "lib/arm64-v8a/libmagisk64.so",
    "lib/arm64-v8a/libmagiskboot.so",
    "lib/arm64-v8a/libmagiskinit.so",
    "lib/armeabi-v7a/libmagisk32.so",
    "lib/armeabi-v7a/libmagiskboot.so",
    "lib/armeabi-v7a/libmagiskinit.so",
    "lib/x86/libmagisk32.so",
    "lib/x86/libmagiskboot.so",
    "lib/x86/libmagiskinit.so",
    "lib/x86_64/libmagisk64.so",
    "lib/x86_64/libmagiskboot.so",
    "lib/x86_64/libmagiskinit.so",
];

/// Each entry's contents are its own name.
fn build_apk(entries: &[&str]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for name in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(name.as_bytes()).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

fn select(
    entries: &[&str],
    arch: Arch,
    host: HostPlatform,
) -> (TempDir, Workspace, StagedPayloads) {
    let temp_dir = TempDir::new().unwrap();
    let workspace = Workspace::open(temp_dir.path()).unwrap();

    let mut zip = ZipArchive::new(Cursor::new(build_apk(entries))).unwrap();
    let staged = payload::select_payload_from(&mut zip, arch, &host, &workspace).unwrap();

    (temp_dir, workspace, staged)
}

fn contents(workspace: &Workspace, name: &str) -> String {
    workspace.read_to_string(name).unwrap()
}

#[test]
fn arm64_on_linux_arm64_host() {
    let (_temp_dir, workspace, staged) = select(
        APK_ENTRIES,
        Arch::Arm64,
        HostPlatform::new("linux", "aarch64"),
    );

    assert_eq!(
        staged,
        StagedPayloads {
            stub: true,
            toolkit: true,
            magisk32: true,
            magisk64: true,
            magiskinit: true,
        },
    );
    assert_eq!(contents(&workspace, payload::STUB), "assets/stub.apk");
    assert_eq!(
        contents(&workspace, payload::MAGISK32),
        "lib/armeabi-v7a/libmagisk32.so",
    );
    assert_eq!(
        contents(&workspace, payload::MAGISK64),
        "lib/arm64-v8a/libmagisk64.so",
    );
    assert_eq!(
        contents(&workspace, payload::MAGISKINIT),
        "lib/arm64-v8a/libmagiskinit.so",
    );
    assert_eq!(
        contents(&workspace, payload::TOOLKIT),
        "lib/arm64-v8a/libmagiskboot.so",
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(workspace.path().join(payload::TOOLKIT)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
    }
}

#[test]
fn windows_host_gets_no_toolkit() {
    let (_temp_dir, workspace, staged) = select(
        APK_ENTRIES,
        Arch::Arm64,
        HostPlatform::new("windows", "x86_64"),
    );

    assert!(!staged.toolkit);
    assert!(!workspace.exists(payload::TOOLKIT));
    assert!(staged.magiskinit);
}

#[test]
fn toolkit_follows_host_not_target() {
    let (_temp_dir, workspace, staged) = select(
        APK_ENTRIES,
        Arch::Arm64,
        HostPlatform::new("linux", "x86_64"),
    );

    assert!(staged.toolkit);
    assert_eq!(
        contents(&workspace, payload::TOOLKIT),
        "lib/x86_64/libmagiskboot.so",
    );
    assert_eq!(
        contents(&workspace, payload::MAGISKINIT),
        "lib/arm64-v8a/libmagiskinit.so",
    );
}

#[test]
fn x86_64_target() {
    let (_temp_dir, workspace, staged) = select(
        APK_ENTRIES,
        Arch::X86_64,
        HostPlatform::new("windows", "x86_64"),
    );

    assert!(staged.magisk32 && staged.magisk64 && staged.magiskinit);
    assert_eq!(
        contents(&workspace, payload::MAGISK32),
        "lib/x86/libmagisk32.so",
    );
    assert_eq!(
        contents(&workspace, payload::MAGISK64),
        "lib/x86_64/libmagisk64.so",
    );
}

#[test]
fn arm_target_has_no_magisk64() {
    let (_temp_dir, workspace, staged) = select(
        APK_ENTRIES,
        Arch::Arm,
        HostPlatform::new("windows", "x86_64"),
    );

    assert!(staged.magisk32);
    assert!(!staged.magisk64);
    assert!(!workspace.exists(payload::MAGISK64));
    assert_eq!(
        contents(&workspace, payload::MAGISKINIT),
        "lib/armeabi-v7a/libmagiskinit.so",
    );
}

#[test]
fn missing_counterparts_are_skipped() {
    let (_temp_dir, workspace, staged) = select(
        &["lib/arm64-v8a/libmagiskinit.so"],
        Arch::Arm64,
        HostPlatform::new("linux", "aarch64"),
    );

    assert_eq!(
        staged,
        StagedPayloads {
            magiskinit: true,
            ..Default::default()
        },
    );
    assert!(!workspace.exists(payload::MAGISK32));
    assert!(!workspace.exists(payload::MAGISK64));
    assert!(!workspace.exists(payload::STUB));
}

#[test]
fn unrelated_entries_are_not_read() {
    let mut entries = APK_ENTRIES.to_vec();
    entries.push("res/raw/corrupted.bin");
    let mut apk = build_apk(&entries);

    // Break the stored data so that reading the entry fails its CRC check.
    let needle = b"res/raw/corrupted.bin";
    let offset = apk
        .windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == &needle[..])
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    apk[offset] ^= 0xff;

    let temp_dir = TempDir::new().unwrap();
    let workspace = Workspace::open(temp_dir.path()).unwrap();
    let mut zip = ZipArchive::new(Cursor::new(apk)).unwrap();

    let staged = payload::select_payload_from(
        &mut zip,
        Arch::Arm64,
        &HostPlatform::new("linux", "aarch64"),
        &workspace,
    )
    .unwrap();
    assert!(staged.magiskinit && staged.magisk64 && staged.toolkit);
}

#[test]
fn existing_files_are_overwritten() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = Workspace::open(temp_dir.path()).unwrap();
    workspace.write(payload::MAGISKINIT, b"old").unwrap();

    let mut zip = ZipArchive::new(Cursor::new(build_apk(APK_ENTRIES))).unwrap();
    payload::select_payload_from(
        &mut zip,
        Arch::X86,
        &HostPlatform::new("windows", "x86_64"),
        &workspace,
    )
    .unwrap();

    assert_eq!(
        contents(&workspace, payload::MAGISKINIT),
        "lib/x86/libmagiskinit.so",
    );
}

#[test]
fn select_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let apk = temp_dir.path().join("Magisk.apk");
    fs::write(&apk, build_apk(APK_ENTRIES)).unwrap();
    let workspace = Workspace::open(&temp_dir.path().join("work")).unwrap();

    let staged = payload::select_payload(
        &apk,
        Arch::Arm64,
        &HostPlatform::new("windows", "x86_64"),
        &workspace,
    )
    .unwrap();

    assert!(staged.magiskinit && staged.stub);
}

#[test]
fn missing_package() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = Workspace::open(temp_dir.path()).unwrap();
    let apk = temp_dir.path().join("missing.apk");

    let result = payload::select_payload(
        &apk,
        Arch::Arm64,
        &HostPlatform::current(),
        &workspace,
    );
    assert_matches!(result, Err(Error::File(p, _)) if p == apk);
}

#[test]
fn not_a_zip() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = Workspace::open(temp_dir.path()).unwrap();
    let apk = temp_dir.path().join("Magisk.apk");
    fs::write(&apk, b"not a zip").unwrap();

    let result = payload::select_payload(
        &apk,
        Arch::Arm64,
        &HostPlatform::current(),
        &workspace,
    );
    assert_matches!(result, Err(Error::Zip(_)));
}
