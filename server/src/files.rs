use std::{io, path::Path};

use common::data::ByteRange;
use tokio::{
    fs::{metadata, File},
    io::{AsyncReadExt, AsyncSeekExt},
};

async fn get_file(path: &Path) -> io::Result<File> {
    File::options().read(true).open(path).await
}

pub async fn file_size(path: &Path) -> io::Result<u64> {
    Ok(metadata(path).await?.len())
}

pub async fn file_exists(path: &Path) -> io::Result<bool> {
    match metadata(path).await {
        Ok(m) => Ok(m.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads exactly the bytes of `range`. Every caller opens its own handle, so
/// parts of one archive can be read concurrently.
pub async fn read_range(path: &Path, range: ByteRange) -> io::Result<Vec<u8>> {
    let len: usize = match range.len().try_into() {
        Ok(len) => len,
        Err(_) => return Err(io::Error::other("Range too large")),
    };
    let mut file = get_file(path).await?;
    file.seek(io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
