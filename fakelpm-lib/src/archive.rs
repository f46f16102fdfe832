//! Canned historical downloads.
//!
//! Each archive blob is base64 text wrapping `"D4"` followed by the hex
//! dump of one or more 48-byte measurement payloads.

use crate::constants::{MAX_RECORDS, MEASUREMENT_BLOCK, MIN_RECORDS, PAYLOAD_LEN};
use crate::error::LpmError;
use crate::payload::{LampReading, MeasurementData};
use crate::source::MeasurementSource;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use zerocopy::FromBytes;

/// Historical samples captured from a field unit.
pub const SAMPLE_ARCHIVES: &[&str] = &[
    "RDQ4N0U4MTExODI1MDYwNzAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwODlGMjAwMTQwMDk0NkU2MTZENjEwMUZFRkZGRkZGMTgwMzAxMDA4N0U4MTExODI2MDYwNzAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwODlGMzAwMTUwMDI3NDYyNzQ2NTkwMUZFRkZGRkZGMTgwMzAxMDA=",
];

/// Unpack one archive blob into its payloads.
pub fn decode_archive_blob(blob: &str) -> Result<Vec<MeasurementData>, LpmError> {
    let text = BASE64.decode(blob.trim())?;
    let body = text
        .strip_prefix(&MEASUREMENT_BLOCK[..])
        .ok_or_else(|| LpmError::Archive("missing D4 block tag".to_string()))?;
    let raw = hex::decode(body)?;

    if raw.is_empty() || raw.len() % PAYLOAD_LEN != 0 {
        return Err(LpmError::Archive(format!(
            "payload size {} is not a multiple of {}",
            raw.len(),
            PAYLOAD_LEN
        )));
    }

    raw.chunks_exact(PAYLOAD_LEN)
        .map(|chunk| {
            MeasurementData::read_from_bytes(chunk)
                .map_err(|_| LpmError::Archive("Failed to parse payload block".to_string()))
        })
        .collect()
}

/// Decode every blob into engineering-unit readings.
pub fn decode_archive(blobs: &[&str]) -> Result<Vec<LampReading>, LpmError> {
    let mut readings = Vec::new();
    for blob in blobs {
        for data in decode_archive_blob(blob)? {
            readings.extend(data.lamp_readings());
        }
    }
    Ok(readings)
}

/// Replays archived payloads round-robin.
pub struct ArchiveSource {
    payloads: Vec<MeasurementData>,
    cursor: AtomicUsize,
}

impl ArchiveSource {
    pub fn new(blobs: &[&str]) -> Result<Self, LpmError> {
        let mut payloads = Vec::new();
        for blob in blobs {
            payloads.extend(decode_archive_blob(blob)?);
        }
        if payloads.is_empty() {
            return Err(LpmError::Archive("archive holds no payloads".to_string()));
        }
        debug!("Loaded {} archived payloads", payloads.len());
        Ok(Self {
            payloads,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Source over the built-in sample archive.
    pub fn samples() -> Result<Self, LpmError> {
        Self::new(SAMPLE_ARCHIVES)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl MeasurementSource for ArchiveSource {
    /// One pass over the archive, clamped to the download size limits.
    fn batch_len(&self) -> usize {
        self.payloads.len().clamp(MIN_RECORDS, MAX_RECORDS)
    }

    fn next_payload(&self) -> MeasurementData {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.payloads.len();
        self.payloads[index]
    }
}
