// src/security/envelope.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classifies what kind of plaintext an envelope holds, for audit/reporting
/// purposes only — never affects how it is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    IpAddress,
    UserAgent,
    Referrer,
    Notes,
}

/// On-disk envelope metadata: original plaintext length and its checksum,
/// taken before compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(rename = "originalLength")]
    pub original_length: u32,
    pub checksum: String,
}

/// One encrypted field. Field names on the wire match spec §6 exactly:
/// unknown fields are rejected on read (`deny_unknown_fields`), matching the
/// "runtime-typed JSON envelopes become a fixed-schema tagged record" design
/// note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedField {
    #[serde(rename = "encryptedValue")]
    pub encrypted_value: String,
    pub iv: String,
    pub tag: String,
    pub algorithm: String,
    #[serde(rename = "keyVersion")]
    pub key_version: String,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub metadata: EnvelopeMetadata,
}

pub const ALGORITHM: &str = "aes-256-gcm";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let json = serde_json::json!({
            "encryptedValue": "AAAA",
            "iv": "AAAA",
            "tag": "AAAA",
            "algorithm": "aes-256-gcm",
            "keyVersion": "v1_deadbeef",
            "dataType": "NOTES",
            "createdAt": "2024-01-01T00:00:00Z",
            "metadata": { "originalLength": 4, "checksum": "abcd" },
            "unexpectedField": true
        });
        let result: Result<EncryptedField, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let field = EncryptedField {
            encrypted_value: "AAAA".to_string(),
            iv: "AAAA".to_string(),
            tag: "AAAA".to_string(),
            algorithm: ALGORITHM.to_string(),
            key_version: "v1_deadbeef".to_string(),
            data_type: DataType::IpAddress,
            created_at: Utc::now(),
            metadata: EnvelopeMetadata {
                original_length: 7,
                checksum: "abcd".to_string(),
            },
        };
        let json = serde_json::to_string(&field).unwrap();
        assert!(json.contains("encryptedValue"));
        assert!(json.contains("keyVersion"));
        let parsed: EncryptedField = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key_version, field.key_version);
    }
}
