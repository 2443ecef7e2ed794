//! Content-defined chunking and chunk addressing.
//!
//! Files are cut with FastCDC (2020): boundaries come from a gear rolling hash
//! over the content, so an edit only disturbs the chunks it touches and
//! repeated runs of bytes produce repeated chunks.
//!
//! Two digests are fed from each chunk buffer:
//! - [`content_key`]: MD5 over the chunk alone, the dedup identity and remote
//!   object key;
//! - [`FileDigest`]: running SHA-256 over the whole file, fed in chunk order.

use fastcdc::v2020::{self, StreamCDC};
use sha2::{Digest, Sha256};
use std::io::Read;

use crate::config::ChunkerConfig;
use crate::utils::errors::{BackupError, Result};

/// One chunk cut from a stream
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Offset of the first byte in the source
    pub start: u64,

    /// Owned chunk bytes
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator of content-defined chunks over a reader.
pub struct FileChunker<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> FileChunker<R> {
    pub fn new(source: R, config: &ChunkerConfig) -> Self {
        Self {
            inner: StreamCDC::new(source, config.min_size, config.avg_size, config.max_size),
        }
    }
}

impl<R: Read> Iterator for FileChunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = match self.inner.next()? {
            Ok(chunk) => chunk,
            Err(v2020::Error::IoError(e)) => return Some(Err(BackupError::Io(e))),
            Err(e) => return Some(Err(BackupError::Chunker(format!("{:?}", e)))),
        };

        // The chunker announces a length and hands over a buffer; a mismatch
        // means the stream contract is broken.
        if chunk.data.len() != chunk.length {
            return Some(Err(BackupError::Integrity(format!(
                "chunk at offset {} announced {} bytes but carried {}",
                chunk.offset,
                chunk.length,
                chunk.data.len()
            ))));
        }

        Some(Ok(Chunk {
            start: chunk.offset,
            data: chunk.data,
        }))
    }
}

/// Check chunker sizes against the bounds FastCDC accepts.
pub fn validate_sizes(config: &ChunkerConfig) -> Result<()> {
    let in_range = (v2020::MINIMUM_MIN..=v2020::MINIMUM_MAX).contains(&config.min_size)
        && (v2020::AVERAGE_MIN..=v2020::AVERAGE_MAX).contains(&config.avg_size)
        && (v2020::MAXIMUM_MIN..=v2020::MAXIMUM_MAX).contains(&config.max_size);

    if in_range {
        Ok(())
    } else {
        Err(BackupError::Config(format!(
            "chunker sizes {}/{}/{} outside supported bounds",
            config.min_size, config.avg_size, config.max_size
        )))
    }
}

/// Content-addressing key of a chunk: lowercase hex MD5 of its bytes.
pub fn content_key(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// Running whole-file SHA-256
#[derive(Default)]
pub struct FileDigest {
    hasher: Sha256,
}

impl FileDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;

    /// Small sizes so tests exercise many boundaries on little data.
    pub(crate) fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 256,
            avg_size: 1024,
            max_size: 4096,
        }
    }

    /// Deterministic pseudo-random bytes (xorshift64).
    pub(crate) fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn chunks(data: &[u8], config: &ChunkerConfig) -> Vec<Chunk> {
        FileChunker::new(Cursor::new(data.to_vec()), config)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_chunks_tile_input() {
        let data = noise(64 * 1024, 7);
        let chunks = chunks(&data, &small_config());

        assert!(chunks.len() > 4);
        let mut expected = 0u64;
        let mut rebuilt = Vec::new();
        for chunk in &chunks {
            assert_eq!(chunk.start, expected);
            assert!(chunk.len() <= 4096);
            expected += chunk.len();
            rebuilt.extend_from_slice(&chunk.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert!(chunks(&[], &small_config()).is_empty());
    }

    #[test]
    fn test_small_input_is_single_chunk() {
        let chunks = chunks(b"tiny file", &small_config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].data, b"tiny file");
    }

    #[test]
    fn test_insertion_keeps_most_chunks() {
        let data = noise(128 * 1024, 42);
        let mut edited = data.clone();
        edited.splice(1000..1000, b"inserted bytes".iter().copied());

        let before: HashSet<String> = chunks(&data, &small_config())
            .iter()
            .map(|c| content_key(&c.data))
            .collect();
        let after: Vec<String> = chunks(&edited, &small_config())
            .iter()
            .map(|c| content_key(&c.data))
            .collect();

        let shared = after.iter().filter(|k| before.contains(*k)).count();
        assert!(
            shared + 3 >= after.len(),
            "only {} of {} chunks survived a small insertion",
            shared,
            after.len()
        );
    }

    #[test]
    fn test_content_key_is_md5_hex() {
        assert_eq!(content_key(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_key(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_file_digest_is_order_dependent_sha256() {
        let mut digest = FileDigest::new();
        digest.update(b"ab");
        digest.update(b"c");
        assert_eq!(
            digest.finalize_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let mut reversed = FileDigest::new();
        reversed.update(b"c");
        reversed.update(b"ab");
        assert_ne!(
            reversed.finalize_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_validate_sizes() {
        assert!(validate_sizes(&ChunkerConfig::default()).is_ok());
        assert!(validate_sizes(&small_config()).is_ok());
        assert!(validate_sizes(&ChunkerConfig { min_size: 1, avg_size: 2, max_size: 3 }).is_err());
    }
}
