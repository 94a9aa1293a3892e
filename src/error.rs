//! Error types for netlist rewriting, simulation and optimization.

use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, FitError>;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write netlist '{path}': {source}")]
    NetlistWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An analysis statement could not be produced from the configuration.
    #[error("invalid analysis directive: {0}")]
    InvalidDirective(String),

    #[error("failed to launch simulator '{executable}': {source}")]
    SimulatorSpawn {
        executable: String,
        source: std::io::Error,
    },

    #[error("no simulator output found for '{}' (tried: {})", netlist.display(), tried.join(", "))]
    MissingOutput { netlist: PathBuf, tried: Vec<String> },

    #[error("observable '{name}' not found in simulator output; available headers: {}", available.join(", "))]
    UnknownObservable {
        name: String,
        available: Vec<String>,
    },

    #[error("malformed result table '{}': {message}", path.display())]
    ResultTable { path: PathBuf, message: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("solver error: {0}")]
    Solver(String),
}
