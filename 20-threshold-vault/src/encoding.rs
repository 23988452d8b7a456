//! Text-safe encoding for binary fields on the JSON wire.

use base64::{Engine, engine::general_purpose::STANDARD};

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// `#[serde(with = "crate::encoding::base64_bytes")]` for `Vec<u8>` fields.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Owned String: tagged enums buffer their content, so borrowing fails.
        let text = String::deserialize(deserializer)?;
        super::decode(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super::base64_bytes")]
        bytes: Vec<u8>,
    }

    #[test]
    fn binary_fields_become_base64_strings() {
        let blob = Blob {
            bytes: vec![0, 159, 146, 150, 255],
        };
        let json = serde_json::to_string(&blob).expect("serialize");
        assert_eq!(json, r#"{"bytes":"AJ+Slv8="}"#);
        assert_eq!(serde_json::from_str::<Blob>(&json).expect("deserialize"), blob);
    }

    #[test]
    fn invalid_base64_is_a_field_error() {
        let result = serde_json::from_str::<Blob>(r#"{"bytes":"***"}"#);
        assert!(result.is_err());
    }
}
