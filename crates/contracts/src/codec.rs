//! Byte representation of a [`DomainRecord`] as held by the record store.
//!
//! Records are stored as compact JSON documents. The version stamp of a
//! stored record is the sha256 of its exact bytes, which lets writers detect
//! that a record changed between their read and their write.

use hex::ToHex;
use serde_json::Value;
use sha2::Digest;

use crate::DomainRecord;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode domain record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("stored domain record is malformed: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(record: &DomainRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<DomainRecord, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

pub fn version_stamp(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("domain document must be a JSON object")]
    NotAnObject,
    #[error("domain document names no domain")]
    NoDomain,
    #[error("domain document names {0} domains; exactly one is required")]
    MultipleDomains(usize),
    #[error("domain document for {domain} is invalid: {source}")]
    InvalidRecord {
        domain: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Splits an admin document of the form `{"<domain>": <record>}`.
pub fn decode_domain_document(document: Value) -> Result<(String, DomainRecord), DocumentError> {
    let Value::Object(map) = document else {
        return Err(DocumentError::NotAnObject);
    };

    if map.len() > 1 {
        return Err(DocumentError::MultipleDomains(map.len()));
    }

    let Some((domain, raw)) = map.into_iter().next() else {
        return Err(DocumentError::NoDomain);
    };

    let domain = domain.trim().to_string();
    if domain.is_empty() {
        return Err(DocumentError::NoDomain);
    }

    let record = serde_json::from_value::<DomainRecord>(raw).map_err(|source| {
        DocumentError::InvalidRecord {
            domain: domain.clone(),
            source,
        }
    })?;

    Ok((domain, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PathRecord, QueryParamEntry};

    fn sample_document() -> Value {
        serde_json::json!({
            "updated": 1700000000,
            "safe": false,
            "path": {
                "/c/en/us/course-selector.html": {
                    "updated": 1700000001,
                    "safe": false,
                    "qs": [
                        {"courseId": 333333333, "updated": 1700000001},
                        {"courseId": "1234", "updated": 1700000001, "safe": true}
                    ]
                }
            }
        })
    }

    #[test]
    fn decode_reads_nested_document() {
        let bytes = serde_json::to_vec(&sample_document()).expect("fixture should encode");
        let record = decode(&bytes).expect("record should decode");

        assert_eq!(record.updated, 1700000000);
        assert_eq!(record.safe, Some(false));

        let path = record
            .paths
            .get("/c/en/us/course-selector.html")
            .expect("path should exist");
        assert_eq!(path.safe, Some(false));
        assert_eq!(path.query_params.len(), 2);
        assert!(path.query_params[0].matches("courseId", "333333333"));
        assert_eq!(path.query_params[0].safe, None);
        assert_eq!(path.query_params[1].safe, Some(true));
    }

    #[test]
    fn decode_defaults_missing_path_and_qs() {
        let record = decode(br#"{"updated": 5}"#).expect("record should decode");
        assert!(record.paths.is_empty());
        assert_eq!(record.safe, None);

        let record = decode(br#"{"updated": 5, "path": {"/x": {"updated": 5}}}"#)
            .expect("record should decode");
        assert!(record.paths["/x"].query_params.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_fields() {
        let err = decode(br#"{"updated": 1, "paths": {}}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        let err = decode(br#"{"updated": 1, "path": {"/x": {"updated": 1, "query": []}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn encode_omits_absent_verdicts_and_empty_paths() {
        let record = DomainRecord::new(10, None);
        let bytes = encode(&record).expect("record should encode");
        assert_eq!(bytes, br#"{"updated":10}"#.to_vec());

        let mut record = DomainRecord::new(10, Some(true));
        record.paths.insert(
            "/p".to_string(),
            PathRecord {
                updated: 11,
                safe: None,
                query_params: vec![QueryParamEntry {
                    key: "k".to_string(),
                    value: "v".to_string(),
                    updated: 11,
                    safe: Some(false),
                }],
            },
        );
        let value: Value =
            serde_json::from_slice(&encode(&record).expect("record should encode"))
                .expect("encoded bytes should be JSON");
        assert_eq!(
            value,
            serde_json::json!({
                "updated": 10,
                "safe": true,
                "path": {"/p": {"updated": 11, "qs": [{"k": "v", "updated": 11, "safe": false}]}}
            })
        );
    }

    #[test]
    fn version_stamp_is_lowercase_sha256() {
        let stamp = version_stamp(b"abc");
        assert_eq!(
            stamp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn domain_document_requires_exactly_one_domain() {
        let err = decode_domain_document(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, DocumentError::NoDomain));

        let err = decode_domain_document(serde_json::json!({
            "a.example:443": {"updated": 1},
            "b.example:443": {"updated": 1}
        }))
        .unwrap_err();
        assert!(matches!(err, DocumentError::MultipleDomains(2)));

        let err = decode_domain_document(serde_json::json!(["a.example:443"])).unwrap_err();
        assert!(matches!(err, DocumentError::NotAnObject));

        let (domain, record) = decode_domain_document(serde_json::json!({
            "badguys.example:443": sample_document()
        }))
        .expect("document should decode");
        assert_eq!(domain, "badguys.example:443");
        assert_eq!(record.paths.len(), 1);
    }

    #[test]
    fn domain_document_reports_invalid_record() {
        let err = decode_domain_document(serde_json::json!({
            "a.example:443": {"updated": "yesterday"}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::InvalidRecord { ref domain, .. } if domain == "a.example:443"
        ));
    }
}
