//! Integrity checksums for stored record buffers.

use super::RecordId;

/// CRC32 over a stored record. Identity and version are mixed in so a buffer
/// copied to the wrong slot is caught along with a flipped byte.
pub fn record_crc32(id: RecordId, version: i32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&id.cluster().to_be_bytes());
    hasher.update(&id.position().to_be_bytes());
    hasher.update(&version.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// True when `expected` matches the checksum of the given record state.
pub fn verify_record(id: RecordId, version: i32, payload: &[u8], expected: u32) -> bool {
    record_crc32(id, version, payload) == expected
}
