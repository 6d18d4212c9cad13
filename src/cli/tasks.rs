//! Submission file loading
//!
//! A submission file is UTF-8 JSON holding one submission message or an array of them.

use crate::protocol::{SubmissionMessage, parse_submissions};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' is not UTF-8 encoded: {hint}")]
    NotUtf8 { path: PathBuf, hint: String },

    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Submission parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

/// Loads submission messages from disk
pub struct SubmissionLoader;

impl SubmissionLoader {
    fn load_utf8_file(path: &Path) -> Result<String, FileError> {
        debug!("Loading UTF-8 file: {:?}", path);

        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::InvalidData => FileError::NotUtf8 {
                path: path.to_path_buf(),
                hint: "Submission files must be UTF-8 JSON.".to_string(),
            },
            _ => FileError::IoError {
                path: path.to_path_buf(),
                source: e,
            },
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<SubmissionMessage>, FileError> {
        let path = path.as_ref();
        let content = Self::load_utf8_file(path)?;

        let submissions = parse_submissions(&content).map_err(|e| FileError::ParseError {
            path: path.to_path_buf(),
            reason: format!("{:#}", e),
        })?;

        debug!("Loaded {} submissions from {:?}", submissions.len(), path);
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_submission_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"[
                {"id": 1, "query": "recall user preferences"},
                {"id": 2, "query": "draft reply", "dependencies": [1]}
            ]"#,
        )
        .unwrap();

        let submissions = SubmissionLoader::load(&path).unwrap();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[1].dependencies, vec![1]);
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SubmissionLoader::load(dir.path().join("missing.json")),
            Err(FileError::NotFound { .. })
        ));

        let binary = dir.path().join("binary.json");
        fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            SubmissionLoader::load(&binary),
            Err(FileError::NotUtf8 { .. })
        ));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        assert!(matches!(
            SubmissionLoader::load(&broken),
            Err(FileError::ParseError { .. })
        ));
    }
}
