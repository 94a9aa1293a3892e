pub mod analysis;
pub mod circuit;
pub mod cli;
pub mod config;
pub mod constraints;
pub mod error;
pub mod events;
pub mod expr;
pub mod optimizer;
pub mod output;
pub mod parser;
pub mod residual;
pub mod session;
pub mod simulator;
pub mod solver;
pub mod writer;

// Re-export commonly used types
pub use analysis::{AnalysisConfig, AnalysisMode};
pub use circuit::{Component, ElementClass, Netlist, ValueOverlay};
pub use config::JobConfig;
pub use error::{FitError, Result};
pub use events::{Event, EventSink};
pub use optimizer::{OptimizationDriver, OptimizationJob, OptimizationResult};
pub use parser::SpiceParser;
pub use simulator::{ExternalSimulator, SimulationBackend, SimulationOutput};
pub use writer::{AnalysisDirectiveWriter, NetlistWriter};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
