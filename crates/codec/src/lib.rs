//! Compact, byte-stable-within-a-deployment encoding for posting lists and
//! signature vectors. Both are flat lists of 64-bit integers, so a single
//! codec serves both keys.
//!
//! The realization here JSON-serializes the list and then runs it through
//! LZ4 framing, which is cheap on the short, repetitive integer lists that
//! posting lists and signatures tend to be. Any scheme satisfying the
//! round-trip law `decode(encode(xs)) == xs` is a valid substitute.

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decompress: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("failed to serialize list: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize list: {0}")]
    Deserialize(serde_json::Error),
}

/// Encodes a list of 64-bit integers into a compact byte representation.
pub fn encode(xs: &[u64]) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(xs).map_err(CodecError::Serialize)?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

/// Decodes bytes produced by [`encode`] back into the original list.
pub fn decode(bytes: &[u8]) -> Result<Vec<u64>, CodecError> {
    let json = lz4_flex::decompress_size_prepended(bytes)?;
    serde_json::from_slice(&json).map_err(CodecError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_arbitrary_lists() {
        let cases: Vec<Vec<u64>> = vec![
            vec![],
            vec![0],
            vec![u64::MAX],
            vec![1, 2, 3, 4, 5],
            (0..500).map(|i| i * 7919).collect(),
        ];
        for xs in cases {
            let encoded = encode(&xs).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, xs);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not a valid frame").is_err());
    }
}
