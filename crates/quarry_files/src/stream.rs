//! Streamed reads of raw files with offset/length windows and transparent
//! decompression.

use quarry_protocol::{QuarryError, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Compression formats recognized by their leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Bzip2 => "bz2",
            Compression::Xz => "xz",
        }
    }
}

/// Probe the first three bytes for a known compression magic.
pub fn detect_compression(head: &[u8]) -> Option<Compression> {
    if head.starts_with(&[0x1f, 0x8b, 0x08]) {
        Some(Compression::Gzip)
    } else if head.starts_with(b"BZh") {
        Some(Compression::Bzip2)
    } else if head.starts_with(&[0xfd, 0x37, 0x7a]) {
        Some(Compression::Xz)
    } else {
        None
    }
}

pub fn detect_file_compression(path: &Path) -> Result<Option<Compression>> {
    let mut head = [0u8; 3];
    let mut file = File::open(path)?;
    let read = file.read(&mut head)?;
    Ok(detect_compression(&head[..read]))
}

/// Open a window into a raw file.
///
/// `offset` must be non-negative; `length` must be positive or `-1` meaning
/// "to EOF". An offset equal to the file size yields an empty stream; an
/// offset beyond it is a bad request. With `decompress`, gzip/bzip2/xz
/// content is transparently decoded and the window applies to the decoded
/// stream.
pub fn open_raw_file(
    path: &Path,
    offset: i64,
    length: i64,
    decompress: bool,
) -> Result<Box<dyn Read + Send>> {
    if offset < 0 {
        return Err(QuarryError::bad_request(format!(
            "invalid offset: {offset}"
        )));
    }
    if length != -1 && length <= 0 {
        return Err(QuarryError::bad_request(format!(
            "invalid length: {length}"
        )));
    }

    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => QuarryError::not_found(path.to_string_lossy().to_string()),
        _ => QuarryError::Io(err),
    })?;
    let size = file.metadata()?.len();
    let offset = offset as u64;

    let compression = if decompress {
        let mut head = [0u8; 3];
        let mut probe = File::open(path)?;
        let read = probe.read(&mut head)?;
        detect_compression(&head[..read])
    } else {
        None
    };

    let stream: Box<dyn Read + Send> = match compression {
        None => {
            if offset > size {
                return Err(QuarryError::bad_request(format!(
                    "offset {offset} is beyond the file size {size}"
                )));
            }
            let mut file = file;
            file.seek(SeekFrom::Start(offset))?;
            Box::new(file)
        }
        Some(compression) => {
            let reader = BufReader::new(file);
            let mut decoded: Box<dyn Read + Send> = match compression {
                Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
                Compression::Bzip2 => Box::new(bzip2::bufread::BzDecoder::new(reader)),
                Compression::Xz => Box::new(xz2::bufread::XzDecoder::new(reader)),
            };
            // The decoded size is unknown; skip instead of seeking.
            if offset > 0 {
                io::copy(&mut decoded.by_ref().take(offset), &mut io::sink())?;
            }
            decoded
        }
    };

    Ok(match length {
        -1 => stream,
        length => Box::new(stream.take(length as u64)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(mut stream: Box<dyn Read + Send>) -> Vec<u8> {
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_window_reads() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("data.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_all(open_raw_file(&path, 0, -1, false).unwrap()), b"0123456789");
        assert_eq!(read_all(open_raw_file(&path, 3, 4, false).unwrap()), b"3456");
        assert_eq!(read_all(open_raw_file(&path, 8, -1, false).unwrap()), b"89");
    }

    #[test]
    fn test_offset_boundaries() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("data.txt");
        std::fs::write(&path, b"12345").unwrap();

        // offset == size yields an empty stream
        assert!(read_all(open_raw_file(&path, 5, -1, false).unwrap()).is_empty());
        // offset > size is a bad request
        assert!(matches!(
            open_raw_file(&path, 6, -1, false).err().unwrap(),
            QuarryError::BadRequest(_)
        ));
        assert!(matches!(
            open_raw_file(&path, -1, -1, false).err().unwrap(),
            QuarryError::BadRequest(_)
        ));
        assert!(matches!(
            open_raw_file(&path, 0, 0, false).err().unwrap(),
            QuarryError::BadRequest(_)
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = open_raw_file(&temp.path().join("no-file"), 0, -1, false).err().unwrap();
        assert!(matches!(err, QuarryError::NotFound(_)));
    }

    #[test]
    fn test_transparent_gzip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("data.txt.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"decompressed content").unwrap();
        encoder.finish().unwrap();

        assert_eq!(
            read_all(open_raw_file(&path, 0, -1, true).unwrap()),
            b"decompressed content"
        );
        // The window applies to the decoded stream.
        assert_eq!(read_all(open_raw_file(&path, 13, 7, true).unwrap()), b"content");
        // Without decompress the raw bytes come back.
        let raw = read_all(open_raw_file(&path, 0, 2, false).unwrap());
        assert_eq!(raw, [0x1f, 0x8b]);
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(detect_compression(&[0x1f, 0x8b, 0x08]), Some(Compression::Gzip));
        assert_eq!(detect_compression(b"BZh9"), Some(Compression::Bzip2));
        assert_eq!(detect_compression(&[0xfd, 0x37, 0x7a, 0x58]), Some(Compression::Xz));
        assert_eq!(detect_compression(b"plain"), None);
        assert_eq!(detect_compression(b""), None);
    }
}
