//! Hierarchical checksums over 1 MiB chunks.
//!
//! Every chunk is hashed with SHA-256. The resulting hex digests are then
//! reduced pairwise: each adjacent pair is replaced by the SHA-256 of the
//! concatenation of their hex strings, and an odd digest at the end of a
//! round is carried up unchanged. The single remaining digest is the tree
//! hash. An empty input hashes as a single empty chunk.

use std::io::{self, Read};

use base16ct::lower::encode_string;
use sha2::{Digest, Sha256};

pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let rv: [u8; 32] = Sha256::digest(data).into();
    encode_string(&rv)
}

/// Reduces a level of digests until one remains. `None` for an empty level.
pub fn combine(mut level: Vec<String>) -> Option<String> {
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut joined = String::with_capacity(left.len() + right.len());
                    joined.push_str(left);
                    joined.push_str(right);
                    sha256_hex(joined.as_bytes())
                }
                [odd] => odd.clone(),
                _ => unreachable!(),
            })
            .collect();
    }
    level.pop()
}

pub fn tree_hash(data: &[u8]) -> String {
    let leaves = data.chunks(CHUNK_SIZE).map(sha256_hex).collect();
    combine(leaves).unwrap_or_else(|| sha256_hex(&[]))
}

/// Tree hash of everything `reader` yields, holding one chunk in memory at a time.
pub fn tree_hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut leaves = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let filled = fill_chunk(&mut reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        leaves.push(sha256_hex(&buf[..filled]));
        if filled < CHUNK_SIZE {
            break;
        }
    }
    Ok(combine(leaves).unwrap_or_else(|| sha256_hex(&[])))
}

// A short read from `Read::read` does not mean EOF, so keep going until the
// chunk is full or the reader is drained.
fn fill_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
