//! Source file bookkeeping for one loop execution

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A document consulted while answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub filename: String,
    pub file_id: String,
}

/// Ordered set of file references, unique by filename.
///
/// The first registration of a filename wins; later ones are ignored even
/// if they carry a different file id.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Vec<FileReference>,
    seen: HashSet<String>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file; returns true if the filename was new
    pub fn register(&mut self, filename: &str, file_id: &str) -> bool {
        if !self.seen.insert(filename.to_string()) {
            return false;
        }
        self.files.push(FileReference {
            filename: filename.to_string(),
            file_id: file_id.to_string(),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn into_files(self) -> Vec<FileReference> {
        self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_wins() {
        let mut registry = FileRegistry::new();
        assert!(registry.register("policy-x.pdf", "file-1"));
        assert!(registry.register("clauses.md", "file-2"));
        assert!(!registry.register("policy-x.pdf", "file-9"));

        let files = registry.into_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_id, "file-1");
        assert_eq!(files[1].filename, "clauses.md");
    }

    #[test]
    fn test_serialized_shape() {
        let reference = FileReference {
            filename: "a.pdf".into(),
            file_id: "file-a".into(),
        };
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["fileId"], "file-a");
    }
}
