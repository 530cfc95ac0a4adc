use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{RaglineError, Result};

use super::EvaluationMetric;

/// Append-only record of evaluation metrics, optionally mirrored to a
/// JSON-lines file
#[derive(Debug, Default)]
pub struct EvaluationLog {
    entries: Vec<EvaluationMetric>,
    path: Option<PathBuf>,
}

impl EvaluationLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Log backed by `path`; existing entries are loaded
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            read_entries(&path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    pub fn append(&mut self, metric: EvaluationMetric) -> Result<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| RaglineError::Io {
                    source: e,
                    context: format!("Failed to create log directory: {:?}", parent),
                })?;
            }
            let line = serde_json::to_string(&metric).map_err(|e| RaglineError::Json {
                source: e,
                context: "Failed to serialize evaluation metric".to_string(),
            })?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| RaglineError::Io {
                    source: e,
                    context: format!("Failed to open evaluation log: {:?}", path),
                })?;
            writeln!(file, "{}", line).map_err(|e| RaglineError::Io {
                source: e,
                context: format!("Failed to write evaluation log: {:?}", path),
            })?;
        }
        self.entries.push(metric);
        Ok(())
    }

    pub fn entries(&self) -> &[EvaluationMetric] {
        &self.entries
    }

    /// Every entry recorded for `model`, oldest first
    pub fn history(&self, model: &str) -> Vec<&EvaluationMetric> {
        self.entries.iter().filter(|m| m.model == model).collect()
    }
}

fn read_entries(path: &Path) -> Result<Vec<EvaluationMetric>> {
    let file = std::fs::File::open(path).map_err(|e| RaglineError::Io {
        source: e,
        context: format!("Failed to open evaluation log: {:?}", path),
    })?;

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to read evaluation log: {:?}", path),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line).map_err(|e| RaglineError::Json {
            source: e,
            context: format!("Corrupt evaluation log entry in {:?}", path),
        })?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_persists_as_json_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("evaluations.jsonl");

        let mut log = EvaluationLog::open(&path).unwrap();
        log.append(EvaluationMetric::unavailable("model-a", "down"))
            .unwrap();
        log.append(EvaluationMetric::unavailable("model-b", "down"))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let reopened = EvaluationLog::open(&path).unwrap();
        assert_eq!(reopened.entries().len(), 2);
        assert_eq!(reopened.history("model-b").len(), 1);
    }

    #[test]
    fn test_in_memory_log() {
        let mut log = EvaluationLog::in_memory();
        log.append(EvaluationMetric::unavailable("m", "x")).unwrap();
        assert_eq!(log.entries().len(), 1);
    }
}
