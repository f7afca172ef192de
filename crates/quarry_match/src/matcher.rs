//! The match pipeline: file path + initial bytes -> at most one parser.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use quarry_files::mime::mime_from_buffer;
use quarry_files::stream::{detect_compression, Compression};
use quarry_protocol::Result;
use tracing::debug;

use crate::registry::ParserRegistry;

/// Evaluates the registry against candidate mainfiles.
pub struct Matcher {
    registry: Arc<ParserRegistry>,
    /// Bytes read for the content probe.
    matching_size: usize,
    /// Try ISO-8859-1 when UTF-8 decoding fails.
    force_raw_file_decoding: bool,
}

impl Matcher {
    pub fn new(
        registry: Arc<ParserRegistry>,
        matching_size: usize,
        force_raw_file_decoding: bool,
    ) -> Self {
        Self {
            registry,
            matching_size,
            force_raw_file_decoding,
        }
    }

    pub fn registry(&self) -> &Arc<ParserRegistry> {
        &self.registry
    }

    /// Match a candidate mainfile; first positive match wins, order is fixed
    /// at process start. Returns the parser name.
    ///
    /// `rel_path` is the upload-relative path the name regexes run against;
    /// `os_path` is where the bytes live. With `strict`, placeholder parsers
    /// are not offered.
    pub fn match_parser(
        &self,
        rel_path: &str,
        os_path: &Path,
        strict: bool,
    ) -> Result<Option<&'static str>> {
        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if basename.starts_with('.') || basename.starts_with('~') {
            return Ok(None);
        }

        let mut head = [0u8; 3];
        let mut file = File::open(os_path)?;
        let read = file.read(&mut head)?;
        let compression = detect_compression(&head[..read]);

        let buffer = self.probe(os_path, compression)?;
        let mime = mime_from_buffer(os_path, &buffer);

        let mut used_fallback_encoding = false;
        let decoded: Option<String> = match String::from_utf8(buffer.clone()) {
            Ok(text) => Some(text),
            Err(_) if self.force_raw_file_decoding => {
                used_fallback_encoding = true;
                Some(decode_latin1(&buffer))
            }
            Err(_) => None,
        };

        for registered in self.registry.iter() {
            if strict && registered.spec.placeholder {
                continue;
            }
            if registered
                .spec
                .is_mainfile(rel_path, &mime, decoded.as_deref(), compression)
            {
                if used_fallback_encoding && compression.is_none() {
                    convert_to_utf8(os_path)?;
                }
                debug!(mainfile = rel_path, parser = registered.spec.name, "matched parser");
                return Ok(Some(registered.spec.name));
            }
        }
        Ok(None)
    }

    /// Read the first `matching_size` bytes, transparently decompressed.
    fn probe(&self, os_path: &Path, compression: Option<Compression>) -> Result<Vec<u8>> {
        let file = File::open(os_path)?;
        let mut reader: Box<dyn Read> = match compression {
            Some(Compression::Gzip) => Box::new(flate2::read::MultiGzDecoder::new(file)),
            Some(Compression::Bzip2) => Box::new(bzip2::read::BzDecoder::new(file)),
            Some(Compression::Xz) => Box::new(xz2::read::XzDecoder::new(file)),
            None => Box::new(file),
        };
        let mut buffer = Vec::with_capacity(self.matching_size.min(64 * 1024));
        reader
            .by_ref()
            .take(self.matching_size as u64)
            .read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// ISO-8859-1 maps every byte to the code point of the same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Convert a file that only decoded through the 8859 fallback to UTF-8 in
/// place, so parsers read it as text.
fn convert_to_utf8(os_path: &Path) -> Result<()> {
    let bytes = std::fs::read(os_path)?;
    if String::from_utf8(bytes.clone()).is_ok() {
        return Ok(());
    }
    std::fs::write(os_path, decode_latin1(&bytes))?;
    Ok(())
}
