//! Shared logging setup for Quarry binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "quarry=info,quarry_processing=info,quarry_files=info";
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_LOG_GENERATIONS: usize = 5;

/// Logging configuration shared by Quarry binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub log_dir: PathBuf,
    pub verbose: bool,
}

/// Initialize tracing with a size-rotated log file and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    fs::create_dir_all(&config.log_dir).with_context(|| {
        format!(
            "Failed to create log directory: {}",
            config.log_dir.display()
        )
    })?;
    let log_path = config.log_dir.join(format!("{}.log", config.app_name));
    let log_file = LogFile::open(log_path, MAX_LOG_FILE_SIZE, MAX_LOG_GENERATIONS)
        .context("Failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// A log file rotated by size.
///
/// The live file sits at `<app>.log`; on overflow it is shifted to
/// `<app>.log.1` and the older generations move up, dropping the oldest.
struct LogFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    generations: usize,
}

impl LogFile {
    fn open(path: PathBuf, max_size: u64, generations: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        let mut log = Self {
            path,
            file,
            written,
            max_size,
            generations: generations.max(2),
        };
        if log.written > log.max_size {
            log.rotate()?;
        }
        Ok(log)
    }

    fn generation_path(&self, n: usize) -> PathBuf {
        if n == 0 {
            self.path.clone()
        } else {
            PathBuf::from(format!("{}.{n}", self.path.display()))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let oldest = self.generation_path(self.generations - 1);
        if oldest.exists() {
            fs::remove_file(oldest)?;
        }
        for n in (0..self.generations - 1).rev() {
            let from = self.generation_path(n);
            if from.exists() {
                fs::rename(from, self.generation_path(n + 1))?;
            }
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_on_overflow() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("quarry.log");
        let mut log = LogFile::open(path.clone(), 64, 3).unwrap();

        for _ in 0..6 {
            log.write_all(&[b'x'; 32]).unwrap();
        }
        log.flush().unwrap();

        assert!(path.exists());
        assert!(temp.path().join("quarry.log.1").exists());
        // The live file stays under the size limit after rotation.
        assert!(fs::metadata(&path).unwrap().len() <= 64);
    }

    #[test]
    fn test_oldest_generation_is_dropped() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("quarry.log");
        let mut log = LogFile::open(path, 16, 3).unwrap();

        for _ in 0..10 {
            log.write_all(&[b'y'; 16]).unwrap();
        }
        log.flush().unwrap();

        assert!(temp.path().join("quarry.log.1").exists());
        assert!(temp.path().join("quarry.log.2").exists());
        assert!(
            !temp.path().join("quarry.log.3").exists(),
            "only the configured generations are kept"
        );
    }

    #[test]
    fn test_oversized_existing_file_rotates_on_open() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("quarry.log");
        fs::write(&path, vec![b'z'; 128]).unwrap();

        let log = LogFile::open(path.clone(), 64, 3).unwrap();
        assert_eq!(log.written, 0);
        assert!(temp.path().join("quarry.log.1").exists());
    }
}
