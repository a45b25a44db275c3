//! Job documents as delivered by the job queue

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

/// Operation requested by a job document
///
/// Unknown operations are kept verbatim so dispatch can reject them
/// explicitly instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Download,
    Cancel,
    Other(String),
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        match value.as_str() {
            "DOWNLOAD" => Self::Download,
            "CANCEL" => Self::Cancel,
            _ => Self::Other(value),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.to_string()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("DOWNLOAD"),
            Self::Cancel => f.write_str("CANCEL"),
            Self::Other(op) => f.write_str(op),
        }
    }
}

/// Where mission artefacts belong once the flight is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionMetadata {
    pub outpost: String,
    pub group: String,
    pub bucket: String,
}

/// One unit of remotely requested work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub operation: Operation,
    pub mission_uuid: String,
    pub download_url: String,
    pub download_path: String,
    pub metadata: MissionMetadata,
}

impl Job {
    pub fn is_cancel(&self) -> bool {
        self.operation == Operation::Cancel
    }

    /// Validate a raw document against the job schema and deserialize it
    ///
    /// Returns `None` for anything that does not match the schema.
    pub fn from_document(document: &Value) -> Option<Self> {
        let validator = schema_validator()?;
        if !validator.is_valid(document) {
            let errors: Vec<String> = validator
                .iter_errors(document)
                .map(|e| e.to_string())
                .collect();
            warn!(errors = ?errors, "Job document failed schema validation");
            return None;
        }

        match serde_json::from_value(document.clone()) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "Job document could not be deserialized");
                None
            }
        }
    }
}

/// Raw answer of a `describe_job` request
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescription {
    pub job_id: String,
    pub document: Value,
}

impl JobDescription {
    pub fn new(job_id: impl Into<String>, document: Value) -> Self {
        Self {
            job_id: job_id.into(),
            document,
        }
    }
}

/// JSON schema every job document must satisfy
pub fn job_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "operation": {"type": "string"},
            "mission_uuid": {"type": "string"},
            "download_url": {"type": "string"},
            "download_path": {"type": "string"},
            "metadata": {
                "type": "object",
                "properties": {
                    "outpost": {"type": "string"},
                    "group": {"type": "string"},
                    "bucket": {"type": "string"}
                },
                "required": ["outpost", "group", "bucket"]
            }
        },
        "required": ["operation", "mission_uuid", "download_url", "download_path", "metadata"]
    })
}

fn schema_validator() -> Option<&'static jsonschema::Validator> {
    static VALIDATOR: OnceLock<Option<jsonschema::Validator>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| match jsonschema::validator_for(&job_schema()) {
            Ok(validator) => Some(validator),
            Err(e) => {
                warn!(error = %e, "Failed to compile job schema");
                None
            }
        })
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_document() -> Value {
        json!({
            "operation": "DOWNLOAD",
            "mission_uuid": "m1",
            "download_url": "https://x/y.zip",
            "download_path": "/tmp/m1",
            "metadata": {"outpost": "a", "group": "b", "bucket": "c"}
        })
    }

    #[test]
    fn test_parse_download_document() {
        let job = Job::from_document(&download_document()).unwrap();
        assert_eq!(job.operation, Operation::Download);
        assert_eq!(job.mission_uuid, "m1");
        assert_eq!(job.download_path, "/tmp/m1");
        assert_eq!(job.metadata.bucket, "c");
        assert!(!job.is_cancel());
    }

    #[test]
    fn test_unknown_operation_is_preserved() {
        let mut doc = download_document();
        doc["operation"] = json!("SELF_DESTRUCT");
        let job = Job::from_document(&doc).unwrap();
        assert_eq!(job.operation, Operation::Other("SELF_DESTRUCT".to_string()));
        assert_eq!(job.operation.to_string(), "SELF_DESTRUCT");
    }

    #[test]
    fn test_operation_is_case_sensitive() {
        assert_eq!(Operation::from("cancel".to_string()), Operation::Other("cancel".into()));
        assert_eq!(Operation::from("CANCEL".to_string()), Operation::Cancel);
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let mut doc = download_document();
        doc.as_object_mut().unwrap().remove("download_url");
        assert!(Job::from_document(&doc).is_none());
    }

    #[test]
    fn test_wrong_metadata_type_is_rejected() {
        let mut doc = download_document();
        doc["metadata"] = json!({"outpost": 1, "group": "b", "bucket": "c"});
        assert!(Job::from_document(&doc).is_none());
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(Job::from_document(&json!("DOWNLOAD")).is_none());
        assert!(Job::from_document(&Value::Null).is_none());
    }

    #[test]
    fn test_serializes_operation_as_string() {
        let job = Job::from_document(&download_document()).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value, download_document());
    }
}
