//! Snappy framing for uploaded objects.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Compress `src` into `dst`, returning the compressed size.
pub fn compress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = snap::write::FrameEncoder::new(BufWriter::new(File::create(dst)?));
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder
        .into_inner()
        .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(std::fs::metadata(dst)?.len())
}

/// Decompress `src` into `dst`, returning the decompressed size.
pub fn decompress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = snap::read::FrameDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(written)
}
