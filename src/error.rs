use std::path::PathBuf;

/// Conditions that end a build or update run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The service rejected our credentials; re-run `spinlog authorize`.
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("no streaming history exports found in {}", .0.display())]
    NoExports(PathBuf),
    #[error("none of the {0} streaming history exports could be read")]
    NoReadableExports(usize),
}
