//! Vector byte codec
//!
//! Vectors persist as little-endian IEEE-754 32-bit floats in the
//! `item_vector` BLOB column, length `4 * d`. A blob whose length is not a
//! multiple of 4 is corrupt.

use byteorder::{ByteOrder, LittleEndian};

use beaver_core::{Error, Result};

/// Encode a vector into its on-disk byte form.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; vector.len() * 4];
    LittleEndian::write_f32_into(vector, &mut bytes);
    bytes
}

/// Decode on-disk bytes back into a vector.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Corruption(format!(
            "vector blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    let mut vector = vec![0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut vector);
    Ok(vector)
}
