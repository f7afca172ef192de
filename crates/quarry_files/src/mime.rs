//! Mime probing for raw files.

use quarry_protocol::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Bytes inspected for the magic probe.
pub const PROBE_SIZE: usize = 2048;

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Probe the first 2 KiB of a raw file: magic bytes, then the filename
/// extension, then a plain-text heuristic; `application/octet-stream` when
/// all of them come up empty.
pub fn raw_file_mime(path: &Path) -> Result<String> {
    let mut buffer = vec![0u8; PROBE_SIZE];
    let mut file = File::open(path)?;
    let read = file.read(&mut buffer)?;
    buffer.truncate(read);
    Ok(mime_from_buffer(path, &buffer))
}

pub fn mime_from_buffer(path: &Path, buffer: &[u8]) -> String {
    if let Some(kind) = infer::get(buffer) {
        return kind.mime_type().to_string();
    }
    if let Some(mime) = mime_guess::from_path(path).first_raw() {
        return mime.to_string();
    }
    if !buffer.is_empty() && looks_like_text(buffer) {
        return "text/plain".to_string();
    }
    DEFAULT_MIME.to_string()
}

fn looks_like_text(buffer: &[u8]) -> bool {
    !buffer.contains(&0) && std::str::from_utf8(buffer).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_beats_text_heuristic() {
        assert_eq!(
            mime_from_buffer(Path::new("a/template.json"), b"{\"key\": 1}"),
            "application/json"
        );
    }

    #[test]
    fn test_text_heuristic() {
        assert_eq!(
            mime_from_buffer(Path::new("OUTCAR"), b"vasp output text"),
            "text/plain"
        );
    }

    #[test]
    fn test_binary_default() {
        assert_eq!(
            mime_from_buffer(Path::new("blob.bin"), &[0u8, 1, 2, 3]),
            DEFAULT_MIME
        );
    }

    #[test]
    fn test_magic_bytes() {
        // gzip magic
        let buffer = [0x1f, 0x8b, 0x08, 0x00];
        assert_eq!(
            mime_from_buffer(Path::new("file"), &buffer),
            "application/gzip"
        );
    }
}
