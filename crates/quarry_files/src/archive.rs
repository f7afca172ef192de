//! The packed msg archive: a msgpack-framed file of `(entry_id, archive)`
//! records with random access by entry id.
//!
//! Layout: a big-endian u32 index length, the msgpack-encoded index map
//! `entry_id -> [offset, length]`, then the record payloads. Offsets are
//! relative to the start of the data section, so the index can be sized
//! before any record is placed.

use quarry_protocol::{EntryId, QuarryError, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

fn codec_err(err: impl std::fmt::Display) -> QuarryError {
    QuarryError::ArchiveWriteFailure(err.to_string())
}

/// Collects entry archives and writes them as one packed msg file.
#[derive(Debug, Default)]
pub struct MsgArchiveWriter {
    records: BTreeMap<String, Vec<u8>>,
}

impl MsgArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry_id: &EntryId, archive: &serde_json::Value) -> Result<()> {
        let payload = rmp_serde::to_vec(archive).map_err(codec_err)?;
        self.records.insert(entry_id.to_string(), payload);
        Ok(())
    }

    /// Reserve a slot with an empty archive (the entry failed to process).
    pub fn add_empty(&mut self, entry_id: &EntryId) -> Result<()> {
        self.add(entry_id, &serde_json::json!({}))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn write_to(&self, path: &Path) -> Result<u64> {
        let mut index: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        let mut offset = 0u64;
        for (entry_id, payload) in &self.records {
            index.insert(entry_id.as_str(), (offset, payload.len() as u64));
            offset += payload.len() as u64;
        }

        let index_bytes = rmp_serde::to_vec(&index).map_err(codec_err)?;
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&(index_bytes.len() as u32).to_be_bytes())?;
        writer.write_all(&index_bytes)?;
        for payload in self.records.values() {
            writer.write_all(payload)?;
        }
        writer.flush()?;
        Ok(4 + index_bytes.len() as u64 + offset)
    }
}

/// Random access reader over a packed msg file.
#[derive(Debug)]
pub struct MsgArchiveReader {
    file: File,
    index: BTreeMap<String, (u64, u64)>,
    data_start: u64,
}

impl MsgArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let index_len = u32::from_be_bytes(len_bytes) as usize;

        let mut index_bytes = vec![0u8; index_len];
        file.read_exact(&mut index_bytes)?;
        let index: BTreeMap<String, (u64, u64)> =
            rmp_serde::from_slice(&index_bytes).map_err(codec_err)?;

        Ok(Self {
            file,
            index,
            data_start: 4 + index_len as u64,
        })
    }

    pub fn entry_ids(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(|key| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, entry_id: &EntryId) -> bool {
        self.index.contains_key(entry_id.as_str())
    }

    pub fn read(&mut self, entry_id: &EntryId) -> Result<serde_json::Value> {
        let (offset, length) = *self
            .index
            .get(entry_id.as_str())
            .ok_or_else(|| QuarryError::not_found(entry_id.to_string()))?;
        self.file.seek(SeekFrom::Start(self.data_start + offset))?;
        let mut payload = vec![0u8; length as usize];
        self.file.read_exact(&mut payload)?;
        rmp_serde::from_slice(&payload).map_err(codec_err)
    }
}

/// Read/write a single-entry staging archive file (`archive/{entry_id}.msg`).
pub fn write_entry_archive(path: &Path, archive: &serde_json::Value) -> Result<()> {
    let payload = rmp_serde::to_vec(archive).map_err(codec_err)?;
    std::fs::write(path, payload)?;
    Ok(())
}

pub fn read_entry_archive(path: &Path) -> Result<serde_json::Value> {
    let payload = std::fs::read(path)?;
    rmp_serde::from_slice(&payload).map_err(codec_err)
}
