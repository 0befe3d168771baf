use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{DbError, Result};

/// A fixed-size array of 32-bit integer slots. One page holds either one
/// hidden/user column's worth of base records for a range of RIDs, or one
/// tail page's worth of logical-RID column values.
#[derive(Debug, Clone)]
pub struct Page {
    capacity: usize,
    num_records: usize,
    data: Vec<i32>,
}

/// On-disk form: `{num_records, base64(zlib(raw_bytes))}`, matching the
/// wire layout external tooling expects for a page file.
#[derive(Debug, Serialize, Deserialize)]
struct SerializedPage {
    num_records: usize,
    data: String,
}

impl Page {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            num_records: 0,
            data: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn has_capacity(&self) -> bool {
        self.num_records < self.capacity
    }

    /// Appends `value` at the next free slot, returning that slot index.
    pub fn append(&mut self, value: i32) -> Result<usize> {
        if !self.has_capacity() {
            return Err(DbError::Storage("page is full".to_string()));
        }
        let slot = self.num_records;
        self.data[slot] = value;
        self.num_records += 1;
        Ok(slot)
    }

    pub fn write_at(&mut self, slot: usize, value: i32) -> Result<()> {
        if slot >= self.capacity {
            return Err(DbError::Storage(format!(
                "slot {slot} out of range for page of capacity {}",
                self.capacity
            )));
        }
        self.data[slot] = value;
        if slot >= self.num_records {
            self.num_records = slot + 1;
        }
        Ok(())
    }

    pub fn read(&self, slot: usize) -> Result<i32> {
        if slot >= self.num_records {
            return Err(DbError::Storage(format!(
                "slot {slot} has never been written"
            )));
        }
        Ok(self.data[slot])
    }

    pub fn to_serialized(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.data.len() * 4);
        for v in &self.data {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        let encoded = SerializedPage {
            num_records: self.num_records,
            data: base64::engine::general_purpose::STANDARD.encode(compressed),
        };
        Ok(serde_json::to_vec(&encoded)?)
    }

    pub fn from_serialized(capacity: usize, bytes: &[u8]) -> Result<Self> {
        let encoded: SerializedPage = serde_json::from_slice(bytes)?;
        let compressed = base64::engine::general_purpose::STANDARD
            .decode(&encoded.data)
            .map_err(|e| DbError::Corruption(e.to_string()))?;
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| DbError::Corruption(e.to_string()))?;
        if raw.len() != capacity * 4 {
            return Err(DbError::Corruption(format!(
                "expected {} bytes, got {}",
                capacity * 4,
                raw.len()
            )));
        }
        let mut data = vec![0i32; capacity];
        for (i, chunk) in raw.chunks_exact(4).enumerate() {
            data[i] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self {
            capacity,
            num_records: encoded.num_records,
            data,
        })
    }
}
