//! Locating and reading simulator result tables, plus exporting fitted curves.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisMode;
use crate::error::{FitError, Result};

/// Result-file suffix priority per analysis mode.
///
/// Suffixes are appended to the full netlist file name, so `amp.cir`
/// with `.FD.prn` resolves to `amp.cir.FD.prn`.
#[derive(Debug, Clone, PartialEq)]
pub struct SuffixRegistry {
    suffixes: HashMap<AnalysisMode, Vec<String>>,
}

impl Default for SuffixRegistry {
    fn default() -> Self {
        let mut suffixes = HashMap::new();
        suffixes.insert(AnalysisMode::Transient, vec![".prn".to_string()]);
        suffixes.insert(
            AnalysisMode::Ac,
            vec![".FD.prn".to_string(), ".prn".to_string()],
        );
        suffixes.insert(
            AnalysisMode::Noise,
            vec![
                ".NOISE.prn".to_string(),
                ".NOISE0.prn".to_string(),
                ".FD.prn".to_string(),
                ".prn".to_string(),
            ],
        );
        SuffixRegistry { suffixes }
    }
}

impl SuffixRegistry {
    /// A registry with no suffixes; only the directory fallback applies.
    pub fn empty() -> Self {
        SuffixRegistry {
            suffixes: HashMap::new(),
        }
    }

    pub fn suffixes(&self, mode: AnalysisMode) -> &[String] {
        self.suffixes.get(&mode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Register a suffix ahead of the existing ones for `mode`
    pub fn register(&mut self, mode: AnalysisMode, suffix: impl Into<String>) {
        let suffix = suffix.into();
        let entry = self.suffixes.entry(mode).or_default();
        entry.retain(|existing| existing != &suffix);
        entry.insert(0, suffix);
    }

    /// Replace the whole priority list for `mode`
    pub fn set(&mut self, mode: AnalysisMode, suffixes: Vec<String>) {
        self.suffixes.insert(mode, suffixes);
    }

    fn all(&self) -> Vec<&String> {
        let mut all: Vec<&String> = self.suffixes.values().flatten().collect();
        all.sort();
        all.dedup();
        all
    }
}

/// A comma-delimited simulator result table with numeric rows only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl ResultTable {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file, path)
    }

    /// Parse a table. Rows with any non-numeric field (such as the
    /// trailing "End of simulation" banner) are skipped.
    pub fn from_reader<R: Read>(reader: R, path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.iter().all(String::is_empty) {
            return Err(FitError::ResultTable {
                path: path.to_path_buf(),
                message: "missing header row".to_string(),
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() != headers.len() {
                continue;
            }
            let parsed: Option<Vec<f64>> = record.iter().map(|field| field.parse().ok()).collect();
            if let Some(row) = parsed {
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Err(FitError::ResultTable {
                path: path.to_path_buf(),
                message: "no numeric data rows".to_string(),
            });
        }

        debug!("Read {} rows x {} columns from {}", rows.len(), headers.len(), path.display());
        Ok(ResultTable {
            path: path.to_path_buf(),
            headers,
            rows,
        })
    }

    /// Column index for `name`, tolerant of case and `V(...)` wrapping
    pub fn resolve_column(&self, name: &str) -> Result<usize> {
        let wanted = name.trim().to_uppercase();
        let mut spellings = vec![wanted.clone()];
        if wanted.contains('(') {
            if let Some(inner) = wanted
                .strip_prefix("V(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                spellings.push(inner.trim().to_string());
            }
        } else {
            spellings.push(format!("V({})", wanted));
        }

        spellings
            .iter()
            .find_map(|spelling| {
                self.headers
                    .iter()
                    .position(|header| header.trim().to_uppercase() == *spelling)
            })
            .ok_or_else(|| FitError::UnknownObservable {
                name: name.to_string(),
                available: self.headers.clone(),
            })
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn series(&self, name: &str) -> Result<Vec<f64>> {
        Ok(self.column(self.resolve_column(name)?))
    }

    /// Index of the x-axis column: `x_variable`, then TIME/FREQ, else the
    /// column after the leading index column.
    pub fn x_column(&self, x_variable: &str) -> usize {
        let preferred = [x_variable.trim(), "TIME", "FREQ"];
        preferred
            .iter()
            .filter(|name| !name.is_empty())
            .find_map(|name| {
                self.headers
                    .iter()
                    .position(|header| header.eq_ignore_ascii_case(name))
            })
            .unwrap_or(if self.headers.len() > 1 { 1 } else { 0 })
    }
}

/// Finds the result table the simulator wrote for a netlist
#[derive(Debug, Clone, Default)]
pub struct OutputResolver {
    pub registry: SuffixRegistry,
}

impl OutputResolver {
    pub fn new(registry: SuffixRegistry) -> Self {
        OutputResolver { registry }
    }

    pub fn candidates(&self, netlist: &Path, mode: AnalysisMode) -> Vec<PathBuf> {
        self.registry
            .suffixes(mode)
            .iter()
            .map(|suffix| with_suffix(netlist, suffix))
            .collect()
    }

    /// Remove every result file a previous run may have left next to `netlist`
    pub fn clear_stale(&self, netlist: &Path) -> Result<()> {
        for suffix in self.registry.all() {
            let path = with_suffix(netlist, suffix);
            if path.exists() {
                fs::remove_file(&path)?;
                debug!("Removed stale result file {}", path.display());
            }
        }
        for path in prefixed_results(netlist)? {
            fs::remove_file(&path)?;
            debug!("Removed stale result file {}", path.display());
        }
        Ok(())
    }

    /// First existing candidate in priority order, else the newest
    /// `<netlist>*.prn` in the same directory.
    pub fn locate(&self, netlist: &Path, mode: AnalysisMode) -> Result<PathBuf> {
        let candidates = self.candidates(netlist, mode);
        if let Some(found) = candidates.iter().find(|path| path.exists()) {
            return Ok(found.clone());
        }

        let newest = prefixed_results(netlist)?
            .into_iter()
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified);

        match newest {
            Some((_, path)) => {
                debug!("Using fallback result file {}", path.display());
                Ok(path)
            }
            None => Err(FitError::MissingOutput {
                netlist: netlist.to_path_buf(),
                tried: candidates
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect(),
            }),
        }
    }

    pub fn read(&self, netlist: &Path, mode: AnalysisMode) -> Result<ResultTable> {
        ResultTable::from_path(&self.locate(netlist, mode)?)
    }
}

fn with_suffix(netlist: &Path, suffix: &str) -> PathBuf {
    let mut name = netlist.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Files beside `netlist` named `<netlist file name>...prn`
fn prefixed_results(netlist: &Path) -> Result<Vec<PathBuf>> {
    let Some(file_name) = netlist.file_name().and_then(|name| name.to_str()) else {
        return Ok(Vec::new());
    };
    let dir = match netlist.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name != file_name && name.starts_with(file_name) && name.to_lowercase().ends_with(".prn") {
            found.push(entry.path());
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

/// Target and simulated values on the fitting grid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FittedCurve {
    pub observable: String,
    pub x: Vec<f64>,
    pub target: Vec<f64>,
    pub simulated: Vec<f64>,
}

impl FittedCurve {
    pub fn export(&self, path: &Path, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::Csv => self.export_csv(path),
            OutputFormat::Json => self.export_json(path),
        }
    }

    fn export_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["x", "target", self.observable.as_str(), "residual"])?;
        for ((x, target), simulated) in self.x.iter().zip(&self.target).zip(&self.simulated) {
            writer.write_record(&[
                x.to_string(),
                target.to_string(),
                simulated.to_string(),
                (target - simulated).to_string(),
            ])?;
        }
        writer.flush()?;
        info!("Fitted curve exported to CSV: {}", path.display());
        Ok(())
    }

    fn export_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Fitted curve exported to JSON: {}", path.display());
        Ok(())
    }
}
