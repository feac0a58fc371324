use std::{fs, io};

#[cfg(feature = "db")]
pub mod db;
pub mod payloads;
pub mod data;
pub mod treehash;

/// Tree hash of a whole file, read from its current position to EOF.
pub fn hash_file(file: fs::File) -> io::Result<String> {
    treehash::tree_hash_reader(io::BufReader::new(file))
}
