//! Job queue files for the command line.
//!
//! A queue file names the experiment and lists its jobs in order:
//!
//! ```toml
//! xp_id = 12
//! species = "HP"
//!
//! [[jobs]]
//! startup_delay = 5
//! interval = 2
//! duration = 10
//! voltage = 5
//! current = 1
//! ```
//!
//! Files ending in `.json` are read as JSON with the same shape.

use crate::error::{AppResult, CaptureError};
use crate::jobs::JobSpecInput;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of a queue file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueFile {
    /// Owning experiment.
    pub xp_id: i64,
    /// Species tag.
    pub species: String,
    /// Jobs in execution order.
    #[serde(default)]
    pub jobs: Vec<JobSpecInput>,
}

impl QueueFile {
    /// Reads and parses a queue file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&text)
        } else {
            Self::from_toml(&text)
        }
    }

    /// Parses TOML.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| CaptureError::Configuration(format!("Invalid queue file: {e}")))
    }

    /// Parses JSON.
    pub fn from_json(text: &str) -> AppResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| CaptureError::Configuration(format!("Invalid queue file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_toml_with_defaults() {
        let queue = QueueFile::from_toml(
            r#"
xp_id = 12
species = "HP"

[[jobs]]
startup_delay = 5
interval = 2
duration = 10
voltage = 5
current = 1

[[jobs]]
duration = 30
voltage = 0
current = 0
"#,
        )
        .unwrap();

        assert_eq!(queue.xp_id, 12);
        assert_eq!(queue.jobs.len(), 2);
        assert_eq!(queue.jobs[1].interval, 0.0);
        assert_eq!(queue.jobs[1].startup_delay, 0.0);
    }

    #[test]
    fn loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"xp_id": 3, "species": "SS", "jobs": [{{"interval": 1, "duration": 3, "voltage": 2, "current": 0.5}}]}}"#
        )
        .unwrap();

        let queue = QueueFile::load(file.path()).unwrap();
        assert_eq!(queue.species, "SS");
        assert_eq!(queue.jobs[0].duration, 3.0);
    }

    #[test]
    fn rejects_malformed_files() {
        assert!(QueueFile::from_toml("xp_id = \"twelve\"").is_err());
    }
}
