//! Job File Loading
//!
//! Accepts either a JSON array of job specs or one spec per line (JSON
//! lines). Blank lines are ignored.

use std::path::{Path, PathBuf};

use thiserror::Error;

use dispatch_core::JobSpec;

#[derive(Debug, Error)]
pub enum JobsFileError {
    #[error("failed to read job file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid job spec in {path} at line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("job file {0} contains no jobs")]
    Empty(PathBuf),
}

/// Read and parse a job file
pub async fn load_jobs(path: &Path) -> Result<Vec<JobSpec>, JobsFileError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| JobsFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let specs = parse_jobs(&content).map_err(|(line, source)| JobsFileError::Parse {
        path: path.to_path_buf(),
        line,
        source,
    })?;

    if specs.is_empty() {
        return Err(JobsFileError::Empty(path.to_path_buf()));
    }
    tracing::info!(path = %path.display(), jobs = specs.len(), "Loaded job file");
    Ok(specs)
}

/// Parse job specs, reporting the 1-based line of the first bad entry
fn parse_jobs(content: &str) -> Result<Vec<JobSpec>, (usize, serde_json::Error)> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content).map_err(|e| (e.line(), e));
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| serde_json::from_str(line).map_err(|e| (index + 1, e)))
        .collect()
}
