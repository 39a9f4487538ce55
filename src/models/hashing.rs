use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use sha2::{Digest, Sha256};

const HASH_WINDOW: usize = 8192;

/// Computes content digests of artifact files. The digest is the sole
/// defense against truncated or corrupted downloads, so implementations
/// must be collision-resistant.
pub trait ContentHasher: Send + Sync {
    fn digest_file(&self, path: &Path) -> std::io::Result<String>;
}

/// SHA-256 over a fixed read window, so peak memory stays flat no matter
/// how large the model file is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut stream = Sha256Stream::new();
        let mut buffer = [0u8; HASH_WINDOW];

        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            stream.update(&buffer[..read]);
        }

        Ok(stream.finalize_hex())
    }
}

/// Incremental digest that accepts content one chunk at a time.
#[derive(Default)]
pub struct Sha256Stream {
    inner: Sha256,
}

impl Sha256Stream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    #[must_use]
    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}
