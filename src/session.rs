//! Session numbering, directories and the persisted session log.
//!
//! Sessions live at `<runs>/<a>-<a+9>/<n>/` so a browser can page through
//! them ten at a time. Each holds `session.log` and `optimized.txt`.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, error};

use crate::error::Result;
use crate::optimizer::OptimizationResult;

pub const SESSION_LOG: &str = "session.log";
pub const WORKING_NETLIST: &str = "optimized.txt";
pub const GROUP_SIZE: u32 = 10;
/// Run records kept verbatim in the session log.
pub const RETAINED_RUNS: usize = 3;

const RULE_WIDTH: usize = 80;

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Bucket directory name for session `number`, e.g. `11-20`
pub fn group_name(number: u32) -> String {
    let first = (number.max(1) - 1) / GROUP_SIZE * GROUP_SIZE + 1;
    format!("{}-{}", first, first + GROUP_SIZE - 1)
}

pub fn session_dir(runs_root: &Path, number: u32) -> PathBuf {
    runs_root.join(group_name(number)).join(number.to_string())
}

pub fn session_log_path(runs_root: &Path, number: u32) -> PathBuf {
    session_dir(runs_root, number).join(SESSION_LOG)
}

/// First session number whose log does not exist yet
pub fn next_session_number(runs_root: &Path) -> u32 {
    let mut number = 1;
    while session_log_path(runs_root, number).exists() {
        number += 1;
    }
    number
}

/// A session whose log file has been claimed on disk
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub number: u32,
    pub dir: PathBuf,
    pub log_path: PathBuf,
}

impl Session {
    /// Claim the next free session by exclusively creating its log file.
    /// Concurrent callers never receive the same number.
    pub fn allocate(runs_root: &Path) -> Result<(Session, File)> {
        let mut number = next_session_number(runs_root);
        loop {
            let dir = session_dir(runs_root, number);
            fs::create_dir_all(&dir)?;
            let log_path = dir.join(SESSION_LOG);
            match OpenOptions::new().append(true).create_new(true).open(&log_path) {
                Ok(file) => {
                    debug!("Allocated session {} at {}", number, dir.display());
                    return Ok((
                        Session {
                            number,
                            dir,
                            log_path,
                        },
                        file,
                    ));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => number += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn working_netlist(&self) -> PathBuf {
        self.dir.join(WORKING_NETLIST)
    }
}

/// Log lines captured for one simulator invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub number: usize,
    pub lines: Vec<String>,
}

impl RunRecord {
    pub fn new(number: usize) -> Self {
        RunRecord {
            number,
            lines: Vec::new(),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

/// Settings echoed into the session header
#[derive(Debug, Clone, Default)]
pub struct SessionHeader {
    pub target: String,
    pub netlist: PathBuf,
    pub node_constraints: String,
    pub xtol: f64,
    pub gtol: f64,
    pub ftol: f64,
}

impl SessionHeader {
    pub fn lines(&self) -> Vec<String> {
        vec![
            rule(),
            "Starting new optimization session".to_string(),
            format!("Session started at: {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
            format!("Target value: {}", self.target),
            format!("Netlist file: {}", self.netlist.display()),
            format!("Node constraints: {}", self.node_constraints),
            "Optimization parameters:".to_string(),
            format!("  xtol: {:e}", self.xtol),
            format!("  gtol: {:e}", self.gtol),
            format!("  ftol: {:e}", self.ftol),
            rule(),
        ]
    }
}

/// Appends to one session's log. The footer with metrics and the last
/// run records is written by [`SessionLogger::finish`], or on drop if
/// the session ends early.
#[derive(Debug)]
pub struct SessionLogger {
    session: Session,
    file: File,
    records: VecDeque<RunRecord>,
    metrics: OptimizationResult,
    finished: bool,
}

impl SessionLogger {
    pub fn start(runs_root: &Path, header: &SessionHeader) -> Result<Self> {
        let (session, file) = Session::allocate(runs_root)?;
        let mut logger = SessionLogger {
            session,
            file,
            records: VecDeque::with_capacity(RETAINED_RUNS),
            metrics: OptimizationResult::default(),
            finished: false,
        };
        for line in header.lines() {
            logger.line(&line)?;
        }
        logger.line("")?;
        Ok(logger)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn line(&mut self, message: &str) -> Result<()> {
        writeln!(self.file, "{}", message)?;
        Ok(())
    }

    /// Keep a run record; only the most recent ones survive to the footer
    pub fn push_run(&mut self, record: RunRecord) {
        if self.records.len() == RETAINED_RUNS {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn set_metrics(&mut self, metrics: OptimizationResult) {
        self.metrics = metrics;
    }

    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.write_footer()
    }

    fn write_footer(&mut self) -> Result<()> {
        let metrics = self.metrics;
        self.line("")?;
        self.line("Optimization metrics:")?;
        self.line(&format!("  Total simulator runs: {}", metrics.simulator_runs))?;
        self.line(&format!("  Least squares iterations: {}", metrics.iterations))?;
        self.line(&format!("  Initial cost: {}", metrics.initial_cost))?;
        self.line(&format!("  Final cost: {}", metrics.final_cost))?;
        self.line(&format!("  Optimality: {}", metrics.optimality))?;

        if !self.records.is_empty() {
            self.line("")?;
            self.line(&rule())?;
            self.line(&format!("DETAILED RUN RESULTS (Last {} runs only)", RETAINED_RUNS))?;
            self.line(&rule())?;
            let records: Vec<RunRecord> = self.records.iter().cloned().collect();
            for record in records {
                self.line("")?;
                self.line(&format!("--- RUN {} DETAILS ---", record.number))?;
                for line in &record.lines {
                    self.line(line)?;
                }
            }
        }

        self.line("")?;
        self.line(&rule())?;
        self.line("END OF OPTIMIZATION SESSION")?;
        self.line(&rule())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.write_footer() {
            error!(
                "Failed to write footer for session {}: {}",
                self.session.number, e
            );
        }
    }
}
