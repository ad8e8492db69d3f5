// Binary codec for blocks, transactions and stored entries

use crate::error::Result;
use serde::{Serialize, de::DeserializeOwned};

/// Types stored on disk and sent over the wire.
///
/// Every implementor goes through the same bincode encoding, so a value
/// serialized by one node decodes identically on another.
pub trait Serializable: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        data: Vec<u8>,
    }

    impl Serializable for Sample {}

    #[test]
    fn test_encoding_is_stable() {
        let sample = Sample { id: 7, data: vec![1, 2] };
        let bytes = sample.to_bytes().unwrap();
        // u32 id, u64 length prefix, then the bytes
        assert_eq!(bytes, vec![7, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(Sample::from_bytes(&bytes).unwrap(), sample);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = Sample { id: 1, data: vec![9; 8] }.to_bytes().unwrap();
        assert!(Sample::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
