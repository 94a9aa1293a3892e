use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Captured output of one simulator run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub elapsed: Duration,
}

/// How a line of simulator chatter is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    /// Kept in the run record and forwarded to observers.
    Record,
    /// Forwarded to observers only.
    ForwardOnly,
}

/// Wall-clock lines are never recorded; progress lines only at 20% steps.
pub fn classify_line(line: &str) -> LineDisposition {
    if line.contains("Current system time:") || line.contains("Estimated time to completion:") {
        return LineDisposition::ForwardOnly;
    }

    if let Some((_, rest)) = line.split_once("Percent complete:") {
        let percent = rest.trim().trim_end_matches('%').trim().parse::<f64>();
        return match percent {
            Ok(p) if p >= 20.0 && p % 20.0 == 0.0 => LineDisposition::Record,
            _ => LineDisposition::ForwardOnly,
        };
    }

    LineDisposition::Record
}

impl SimulationOutput {
    /// Non-blank lines of one stream with their disposition
    pub fn classified(text: &str) -> Vec<(String, LineDisposition)> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| (line.to_string(), classify_line(line)))
            .collect()
    }
}

/// Anything that can simulate a netlist file already written to disk.
///
/// The backend writes its result table next to the netlist; the caller
/// locates it afterwards.
pub trait SimulationBackend {
    fn name(&self) -> &str {
        "simulator"
    }

    fn run(&self, netlist: &Path) -> Result<SimulationOutput>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Executable name or path (default: "Xyce" in PATH).
    pub executable: String,
    /// Arguments placed before the netlist path.
    pub args: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            executable: "Xyce".to_string(),
            args: vec!["-delim".to_string(), "COMMA".to_string()],
        }
    }
}

/// Runs an external simulator process, one blocking call per netlist.
#[derive(Debug, Clone, Default)]
pub struct ExternalSimulator {
    config: SimulatorConfig,
}

impl ExternalSimulator {
    pub fn new() -> Self {
        ExternalSimulator::default()
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        ExternalSimulator { config }
    }

    pub fn with_executable(executable: impl Into<String>) -> Self {
        ExternalSimulator {
            config: SimulatorConfig {
                executable: executable.into(),
                ..SimulatorConfig::default()
            },
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Whether the executable can be launched at all
    pub fn is_available(&self) -> bool {
        Command::new(&self.config.executable)
            .arg("-v")
            .output()
            .is_ok()
    }
}

impl SimulationBackend for ExternalSimulator {
    fn name(&self) -> &str {
        &self.config.executable
    }

    fn run(&self, netlist: &Path) -> Result<SimulationOutput> {
        debug!(
            "Running {} {} {}",
            self.config.executable,
            self.config.args.join(" "),
            netlist.display()
        );

        let start = Instant::now();
        let output = Command::new(&self.config.executable)
            .args(&self.config.args)
            .arg(netlist)
            .output()
            .map_err(|source| FitError::SimulatorSpawn {
                executable: self.config.executable.clone(),
                source,
            })?;
        let elapsed = start.elapsed();

        // Failures surface as missing result files; the exit status alone is not fatal
        if !output.status.success() {
            warn!(
                "{} exited with {} for {}",
                self.config.executable,
                output.status,
                netlist.display()
            );
        } else {
            info!(
                "{} finished {} in {:.3}s",
                self.config.executable,
                netlist.display(),
                elapsed.as_secs_f64()
            );
        }

        Ok(SimulationOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
            elapsed,
        })
    }
}
