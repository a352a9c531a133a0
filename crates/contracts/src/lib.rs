use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub mod codec;

const UPDATED_FIELD: &str = "updated";
const SAFE_FIELD: &str = "safe";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRecord {
    #[serde(default)]
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe: Option<bool>,
    #[serde(rename = "path", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<String, PathRecord>,
}

impl DomainRecord {
    pub fn new(updated: i64, safe: Option<bool>) -> Self {
        Self {
            updated,
            safe,
            paths: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRecord {
    #[serde(default)]
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe: Option<bool>,
    #[serde(rename = "qs", default)]
    pub query_params: Vec<QueryParamEntry>,
}

/// One stored fact about a query-parameter key/value pair.
///
/// On the wire the entry is a flat object whose single non-metadata field
/// is the parameter itself: `{"courseId": "111", "updated": 1, "safe": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct QueryParamEntry {
    pub key: String,
    pub value: String,
    pub updated: i64,
    pub safe: Option<bool>,
}

impl QueryParamEntry {
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.key == key && self.value == value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryShapeError {
    #[error("query entry has no parameter field")]
    MissingParameter,
    #[error("query entry has more than one parameter field ({0} and {1})")]
    MultipleParameters(String, String),
    #[error("query entry `{0}` must be a string, number or boolean")]
    NonScalarValue(String),
    #[error("query entry `updated` must be an integer")]
    InvalidUpdated,
    #[error("query entry `safe` must be a boolean")]
    InvalidSafe,
    #[error("query parameter `{0}` collides with entry metadata")]
    ReservedKey(String),
}

/// Parameter names that would collide with the `updated`/`safe` fields of
/// the flat stored entry.
pub fn check_query_key(key: &str) -> Result<(), EntryShapeError> {
    if key == UPDATED_FIELD || key == SAFE_FIELD {
        return Err(EntryShapeError::ReservedKey(key.to_string()));
    }
    Ok(())
}

impl TryFrom<Map<String, Value>> for QueryParamEntry {
    type Error = EntryShapeError;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut updated = 0;
        let mut safe = None;
        let mut param: Option<(String, String)> = None;

        for (k, v) in map {
            match k.as_str() {
                UPDATED_FIELD => {
                    updated = v.as_i64().ok_or(EntryShapeError::InvalidUpdated)?;
                }
                SAFE_FIELD => {
                    safe = match v {
                        Value::Null => None,
                        Value::Bool(b) => Some(b),
                        _ => return Err(EntryShapeError::InvalidSafe),
                    };
                }
                _ => {
                    let value = scalar_to_string(&v)
                        .ok_or_else(|| EntryShapeError::NonScalarValue(k.clone()))?;
                    if let Some((existing, _)) = param {
                        return Err(EntryShapeError::MultipleParameters(existing, k));
                    }
                    param = Some((k, value));
                }
            }
        }

        let (key, value) = param.ok_or(EntryShapeError::MissingParameter)?;
        Ok(Self {
            key,
            value,
            updated,
            safe,
        })
    }
}

impl From<QueryParamEntry> for Map<String, Value> {
    fn from(entry: QueryParamEntry) -> Self {
        let mut map = Map::with_capacity(3);
        map.insert(entry.key, Value::String(entry.value));
        map.insert(UPDATED_FIELD.to_string(), Value::from(entry.updated));
        if let Some(safe) = entry.safe {
            map.insert(SAFE_FIELD.to_string(), Value::Bool(safe));
        }
        map
    }
}

/// Parameter values are compared as strings whatever JSON scalar carried them.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn deserialize_scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_to_string(&value)
        .ok_or_else(|| serde::de::Error::custom("value must be a string, number or boolean"))
}

fn deserialize_query_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let key = String::deserialize(deserializer)?;
    check_query_key(&key).map_err(serde::de::Error::custom)?;
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryEntryUpdate {
    #[serde(deserialize_with = "deserialize_query_key")]
    pub key: String,
    #[serde(deserialize_with = "deserialize_scalar_string")]
    pub value: String,
    #[serde(default)]
    pub safe: Option<bool>,
    #[serde(default)]
    pub updated: Option<i64>,
    /// Set only by the delete path; never accepted from callers.
    #[serde(skip)]
    pub delete: bool,
}

impl QueryEntryUpdate {
    pub fn new(key: impl Into<String>, value: impl Into<String>, safe: Option<bool>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            safe,
            updated: None,
            delete: false,
        }
    }

    pub fn delete_marker(identity: &QueryIdentity) -> Self {
        Self {
            key: identity.key.clone(),
            value: identity.value.clone(),
            safe: None,
            updated: None,
            delete: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryIdentity {
    #[serde(deserialize_with = "deserialize_query_key")]
    pub key: String,
    #[serde(deserialize_with = "deserialize_scalar_string")]
    pub value: String,
}

impl QueryIdentity {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPathRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub safe: Option<bool>,
    #[serde(rename = "qs", default)]
    pub query_params: Vec<QueryEntryUpdate>,
    #[serde(default)]
    pub updated: Option<i64>,
}

impl SetPathRequest {
    pub fn domain(safe: Option<bool>) -> Self {
        Self {
            safe,
            ..Self::default()
        }
    }

    pub fn path(path: impl Into<String>, safe: Option<bool>) -> Self {
        Self {
            path: Some(path.into()),
            safe,
            ..Self::default()
        }
    }

    pub fn with_entry(mut self, entry: QueryEntryUpdate) -> Self {
        self.query_params.push(entry);
        self
    }

    /// Requests built in code skip the serde checks, so writers call this
    /// before touching a stored record.
    pub fn validate(&self) -> Result<(), EntryShapeError> {
        self.query_params
            .iter()
            .try_for_each(|entry| check_query_key(&entry.key))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "qs", default)]
    pub query_params: Vec<QueryIdentity>,
}

impl DeleteRequest {
    pub fn domain() -> Self {
        Self::default()
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            query_params: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: QueryIdentity) -> Self {
        self.query_params.push(identity);
        self
    }

    pub fn validate(&self) -> Result<(), EntryShapeError> {
        self.query_params
            .iter()
            .try_for_each(|identity| check_query_key(&identity.key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub safe: bool,
}

impl Verdict {
    pub const SAFE: Verdict = Verdict { safe: true };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsafe URL {path}")]
pub struct BlockedError {
    pub path: String,
}

impl BlockedError {
    pub fn new(path: Option<&str>) -> Self {
        Self {
            path: path.filter(|p| !p.is_empty()).unwrap_or("/").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_entry_decodes_numeric_values_as_strings() {
        let entry: QueryParamEntry = serde_json::from_value(serde_json::json!({
            "courseId": 111111111,
            "updated": 1700000000,
            "safe": false
        }))
        .expect("entry should decode");

        assert_eq!(entry.key, "courseId");
        assert_eq!(entry.value, "111111111");
        assert_eq!(entry.updated, 1700000000);
        assert_eq!(entry.safe, Some(false));
    }

    #[test]
    fn query_entry_treats_null_safe_as_inherit() {
        let entry: QueryParamEntry =
            serde_json::from_value(serde_json::json!({"lang": "en", "safe": null}))
                .expect("entry should decode");
        assert_eq!(entry.safe, None);
        assert_eq!(entry.updated, 0);
    }

    #[test]
    fn query_entry_rejects_ambiguous_shapes() {
        let err = serde_json::from_value::<QueryParamEntry>(serde_json::json!({
            "a": "1",
            "b": "2"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("more than one parameter"));

        let err = serde_json::from_value::<QueryParamEntry>(serde_json::json!({
            "updated": 1
        }))
        .unwrap_err();
        assert!(err.to_string().contains("no parameter field"));

        let err = serde_json::from_value::<QueryParamEntry>(serde_json::json!({
            "a": {"nested": true}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn query_entry_encodes_flat_and_omits_absent_safe() {
        let entry = QueryParamEntry {
            key: "courseId".to_string(),
            value: "42".to_string(),
            updated: 7,
            safe: None,
        };
        assert_eq!(
            serde_json::to_value(&entry).expect("entry should encode"),
            serde_json::json!({"courseId": "42", "updated": 7})
        );
    }

    #[test]
    fn set_request_accepts_numeric_values_and_rejects_delete_marker() {
        let req: SetPathRequest = serde_json::from_value(serde_json::json!({
            "path": "/p",
            "safe": false,
            "qs": [{"key": "courseId", "value": 1234, "safe": true}]
        }))
        .expect("request should decode");

        assert_eq!(req.path.as_deref(), Some("/p"));
        assert_eq!(req.query_params.len(), 1);
        assert_eq!(req.query_params[0].value, "1234");
        assert!(!req.query_params[0].delete);

        let err = serde_json::from_value::<SetPathRequest>(serde_json::json!({
            "path": "/p",
            "qs": [{"key": "a", "value": "b", "delete": true}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn requests_reject_metadata_names_as_query_keys() {
        for reserved in ["safe", "updated"] {
            let err = serde_json::from_value::<SetPathRequest>(serde_json::json!({
                "path": "/p",
                "qs": [{"key": reserved, "value": "1"}]
            }))
            .unwrap_err();
            assert!(err.to_string().contains("collides with entry metadata"));

            let err = serde_json::from_value::<DeleteRequest>(serde_json::json!({
                "path": "/p",
                "qs": [{"key": reserved, "value": "1"}]
            }))
            .unwrap_err();
            assert!(err.to_string().contains("collides with entry metadata"));

            let built = SetPathRequest::path("/p", None)
                .with_entry(QueryEntryUpdate::new(reserved, "1", None));
            assert_eq!(
                built.validate(),
                Err(EntryShapeError::ReservedKey(reserved.to_string()))
            );
            let built = DeleteRequest::path("/p").with_identity(QueryIdentity::new(reserved, "1"));
            assert!(built.validate().is_err());
        }

        let ok = SetPathRequest::path("/p", None)
            .with_entry(QueryEntryUpdate::new("safeSearch", "1", None));
        assert_eq!(ok.validate(), Ok(()));
    }

    #[test]
    fn blocked_error_reports_root_when_path_missing() {
        assert_eq!(BlockedError::new(None).to_string(), "unsafe URL /");
        assert_eq!(BlockedError::new(Some("/x")).to_string(), "unsafe URL /x");
    }
}
