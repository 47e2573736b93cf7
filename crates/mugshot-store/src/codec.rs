use crate::StoreError;

/// Embedding values as little-endian f32 bytes.
pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &val in values {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_vector(bytes: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
    let expected = dim
        .checked_mul(4)
        .ok_or_else(|| StoreError::Corrupt(format!("embedding dimension {dim} is out of range")))?;
    if bytes.len() != expected {
        return Err(StoreError::Corrupt(format!(
            "expected {expected} bytes for a {dim}-dim embedding, got {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
