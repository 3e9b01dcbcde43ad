//! Canonical encoding for cross-process reproducibility.
//!
//! Uses postcard for byte-stable encoding. Field order is declaration order
//! and collections are encoded in iteration order, so callers must sort
//! anything whose order is not semantically meaningful before encoding.

use remex_core::{CoreError, CoreResult, Digest, DigestUtil};
use serde::{Deserialize, Serialize};

/// Trait for canonical serialization
pub trait CanonicalEncode: Serialize {
    /// Encode to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    fn encode(&self) -> CoreResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(CoreError::from)
    }

    /// Encode and digest in one step, returning both
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    fn digest_with(&self, util: &DigestUtil) -> CoreResult<(Digest, Vec<u8>)> {
        let bytes = self.encode()?;
        Ok((util.compute(&bytes), bytes))
    }
}

/// Trait for canonical deserialization
pub trait CanonicalDecode<'de>: Deserialize<'de> {
    /// Decode from canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid encoding of `Self`
    fn decode(data: &'de [u8]) -> CoreResult<Self>
    where
        Self: Sized,
    {
        postcard::from_bytes(data).map_err(CoreError::from)
    }
}

impl<'de, T: Deserialize<'de>> CanonicalDecode<'de> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestStruct {
        a: u64,
        b: String,
        c: Vec<u32>,
    }

    impl CanonicalEncode for TestStruct {}

    #[test]
    fn test_encode_decode() {
        let original = TestStruct {
            a: 42,
            b: "hello".to_string(),
            c: vec![1, 2, 3],
        };

        let encoded = original.encode().unwrap();
        let decoded = TestStruct::decode(&encoded).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_invalid_decode() {
        let invalid = &[0xFF, 0xFF, 0xFF];
        let result: CoreResult<TestStruct> = TestStruct::decode(invalid);
        assert!(matches!(result, Err(CoreError::InvalidEncoding { .. })));
    }

    #[test]
    fn test_digest_with_matches_bytes() {
        let util = DigestUtil::default();
        let value = TestStruct {
            a: 1,
            b: "x".to_string(),
            c: vec![],
        };
        let (digest, bytes) = value.digest_with(&util).unwrap();
        assert_eq!(digest, util.compute(&bytes));
        assert_eq!(digest.size_bytes, bytes.len() as i64);
    }

    proptest! {
        #[test]
        fn prop_encode_deterministic(a: u64, b: String, c: Vec<u32>) {
            let value = TestStruct { a, b, c };
            let enc1 = value.encode().unwrap();
            let enc2 = value.clone().encode().unwrap();
            prop_assert_eq!(enc1, enc2);
        }
    }
}
