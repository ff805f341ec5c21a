use std::{any::type_name, fmt::Debug};

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Encoding used for every record stored in the state store.
pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: Serialize + Debug>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: Serialize + Debug>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            anyhow!(
                "error serializing into json: {}, type: {}, value: {:?}",
                e,
                type_name::<T>(),
                value
            )
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            anyhow!(
                "error deserializing {} from json bytes: {}",
                type_name::<T>(),
                e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_endpoint;

    use super::*;

    #[test]
    fn test_decode_error_names_type() {
        let err = JsonEncoder::decode::<data_model::Endpoint>(b"{}").unwrap_err();
        assert!(err.to_string().contains("Endpoint"), "{}", err);

        let endpoint = mock_endpoint(1, "edge-1", true);
        let bytes = JsonEncoder::encode(&endpoint).unwrap();
        let decoded: data_model::Endpoint = JsonEncoder::decode(&bytes).unwrap();
        assert_eq!(decoded, endpoint);
    }
}
