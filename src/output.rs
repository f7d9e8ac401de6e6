// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use std::{fs, io, path::Path};

/// Sink for parameter hash digests.
pub trait OutputWriter {
    /// Persists `digest` as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the digest cannot be stored.
    fn write_digest(&mut self, path: &Path, digest: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct FileOutput;

impl OutputWriter for FileOutput {
    fn write_digest(&mut self, path: &Path, digest: &[u8]) -> io::Result<()> {
        fs::write(path, digest)
    }
}
