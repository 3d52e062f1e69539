use std::collections::BTreeSet;
use std::path::Path;

use keel_snapshot::FileCollectionSnapshot;

use crate::error::{HistoryError, Result};

/// Where a record's file snapshot lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotRef {
    /// Persisted in the snapshot repository under this id.
    Stored(i64),
    /// Captured during this build and not persisted yet.
    Unsaved(FileCollectionSnapshot),
}

impl SnapshotRef {
    pub fn stored_id(&self) -> Option<i64> {
        match self {
            SnapshotRef::Stored(id) => Some(*id),
            SnapshotRef::Unsaved(_) => None,
        }
    }
}

/// The summary of one past execution of a work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub work_type: String,
    /// Precheck hash of the inputs the record was taken with.
    pub input_hash: i32,
    /// Precheck hash of the outputs right after execution.
    pub output_hash: i32,
    pub output_signatures: BTreeSet<i32>,
    /// Declared non-file properties as canonical JSON, in declaration order.
    pub input_properties: Vec<(String, String)>,
    pub input_snapshot: SnapshotRef,
    pub output_snapshot: SnapshotRef,
}

impl ExecutionRecord {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.input_properties
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Hash of a declared output's absolute path. Content never contributes.
pub fn output_signature(path: &Path) -> i32 {
    let digest = blake3::hash(path.to_string_lossy().as_bytes());
    let bytes = digest.as_bytes();
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn output_signatures<'a>(paths: impl IntoIterator<Item = &'a Path>) -> BTreeSet<i32> {
    paths.into_iter().map(output_signature).collect()
}

/// Encodes declared properties as canonical JSON, keeping declaration order.
pub fn encode_properties(properties: &[(String, serde_json::Value)]) -> Result<Vec<(String, String)>> {
    properties
        .iter()
        .map(|(name, value)| -> Result<(String, String)> {
            let encoded = serde_json::to_string(value).map_err(|source| HistoryError::Property {
                name: name.clone(),
                source,
            })?;
            Ok((name.clone(), encoded))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signatures_depend_on_the_path_only() {
        let a = output_signature(Path::new("/build/out.txt"));
        assert_eq!(a, output_signature(Path::new("/build/out.txt")));
        assert_ne!(a, output_signature(Path::new("/build/other.txt")));
    }

    #[test]
    fn property_encoding_is_canonical() {
        let encoded = encode_properties(&[
            ("opts".to_string(), json!({"b": 1, "a": [true, null]})),
            ("level".to_string(), json!(3)),
        ])
        .unwrap();
        assert_eq!(
            encoded,
            vec![
                ("opts".to_string(), r#"{"a":[true,null],"b":1}"#.to_string()),
                ("level".to_string(), "3".to_string()),
            ]
        );
    }
}
