// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use ring::digest::Context;

/// A reader wrapper that hashes data as it's being read.
pub struct HashingReader<R> {
    inner: R,
    context: Context,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, context: Context) -> Self {
        Self { inner, context }
    }

    pub fn finish(self) -> (R, Context) {
        (self.inner, self.context)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy `reader` to `writer` until EOF, polling `cancel_signal` before every
/// buffer. Returns the number of bytes copied.
pub fn copy(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Read, Seek},
        sync::atomic::{AtomicBool, Ordering},
    };

    use ring::digest::Context;

    use super::*;

    // sha1("foobar")
    const FOOBAR_SHA1: [u8; 20] = [
        0x88, 0x43, 0xd7, 0xf9, 0x24, 0x16, 0x21, 0x1d, 0xe9, 0xeb, 0xb9, 0x63, 0xff, 0x4c, 0xe2,
        0x81, 0x25, 0x93, 0x28, 0x78,
    ];

    #[test]
    fn hashing_reader() {
        let raw_reader = Cursor::new(b"foobar");
        let mut reader = HashingReader::new(
            raw_reader,
            Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
        );

        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf[..0]).unwrap();
        reader.read_exact(&mut buf[..3]).unwrap();
        reader.read_exact(&mut buf[3..6]).unwrap();
        assert_eq!(&buf, b"foobar");

        let (mut raw_reader, context) = reader.finish();
        assert_eq!(raw_reader.stream_position().unwrap(), 6);
        assert_eq!(context.finish().as_ref(), FOOBAR_SHA1);
    }

    #[test]
    fn copy_counts_bytes() {
        let cancel_signal = AtomicBool::new(false);
        let mut writer = Cursor::new(Vec::new());

        let n = copy(Cursor::new(b"foobar"), &mut writer, &cancel_signal).unwrap();

        assert_eq!(n, 6);
        assert_eq!(writer.into_inner(), b"foobar");
    }

    #[test]
    fn copy_cancelled() {
        let cancel_signal = AtomicBool::new(false);
        cancel_signal.store(true, Ordering::SeqCst);

        let err = copy(Cursor::new(b"foobar"), io::sink(), &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
