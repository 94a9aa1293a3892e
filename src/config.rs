//! JSON job description for one optimization session.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::{
    AcResponse, AcSettings, AnalysisConfig, AnalysisMode, NoiseQuantity, NoiseSettings, SweepSettings,
    SweepType,
};
use crate::constraints::ConstraintRow;
use crate::error::{FitError, Result};
use crate::optimizer::{DefaultBounds, OptimizationJob};
use crate::parser::SpiceParser;
use crate::residual::Curve;
use crate::simulator::SimulatorConfig;
use crate::solver::SolverConfig;

/// Environment variable naming the workspace that holds `runs/`
pub const WORKSPACE_ENV: &str = "SPICEFIT_WORKSPACE";
pub const DEFAULT_RUNS_DIR: &str = "runs";
pub const DEFAULT_TOLERANCE: f64 = 1e-12;

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_executable() -> String {
    SimulatorConfig::default().executable
}

fn default_sweep_type() -> String {
    "DEC".to_string()
}

/// AC sweep as written in a job file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcSettingsConfig {
    #[serde(default = "default_sweep_type")]
    pub sweep_type: String,
    #[serde(default)]
    pub points: Option<usize>,
    #[serde(default)]
    pub start_frequency: Option<f64>,
    #[serde(default)]
    pub stop_frequency: Option<f64>,
    #[serde(default)]
    pub response: Option<String>,
}

/// Noise sweep as written in a job file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseSettingsConfig {
    #[serde(default = "default_sweep_type", alias = "sweep")]
    pub sweep_type: String,
    #[serde(default, alias = "points_per_decade", alias = "points_per_interval")]
    pub points: Option<usize>,
    #[serde(default)]
    pub start_frequency: Option<f64>,
    #[serde(default)]
    pub stop_frequency: Option<f64>,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub output_node: String,
    #[serde(default, alias = "source")]
    pub input_source: String,
}

fn sweep(sweep_type: &str, points: Option<usize>, start: Option<f64>, stop: Option<f64>) -> Result<SweepSettings> {
    let sweep: SweepType = if sweep_type.trim().is_empty() {
        SweepType::Dec
    } else {
        sweep_type.parse()?
    };
    Ok(SweepSettings {
        sweep,
        points: points.filter(|&p| p > 0).unwrap_or(10),
        start,
        stop,
    })
}

/// Explicit bounds for one selected component
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundConfig {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub netlist: PathBuf,
    /// Inline target rows `[x, y]`.
    #[serde(default)]
    pub target: Vec<[f64; 2]>,
    /// Two-column CSV with the target curve, used when `target` is empty.
    #[serde(default)]
    pub target_csv: Option<PathBuf>,
    #[serde(default)]
    pub y_parameter: String,
    #[serde(default)]
    pub x_parameter: Option<String>,
    #[serde(default)]
    pub y_units: String,
    #[serde(default)]
    pub analysis_type: String,
    #[serde(default)]
    pub ac_settings: AcSettingsConfig,
    #[serde(default)]
    pub noise_settings: NoiseSettingsConfig,
    #[serde(default)]
    pub constraints: Vec<ConstraintRow>,
    /// Names of the components the optimizer may move.
    #[serde(default)]
    pub selected_parameters: Vec<String>,
    #[serde(default)]
    pub bounds: BTreeMap<String, BoundConfig>,
    #[serde(default = "default_tolerance")]
    pub xtol: f64,
    #[serde(default = "default_tolerance")]
    pub gtol: f64,
    #[serde(default = "default_tolerance")]
    pub ftol: f64,
    #[serde(default)]
    pub max_evaluations: Option<usize>,
    #[serde(default)]
    pub default_bounds: DefaultBounds,
    #[serde(default = "default_executable")]
    pub simulator: String,
    #[serde(default)]
    pub runs_root: Option<PathBuf>,
}

impl JobConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a job file; relative paths inside it resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config = JobConfig::from_json(&text)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let rebase = |path: &Path| -> PathBuf {
            if path.is_relative() && !base.as_os_str().is_empty() {
                base.join(path)
            } else {
                path.to_path_buf()
            }
        };
        self.netlist = rebase(&self.netlist);
        self.target_csv = self.target_csv.as_deref().map(rebase);
        self.runs_root = self.runs_root.as_deref().map(rebase);
    }

    pub fn analysis_mode(&self) -> Result<AnalysisMode> {
        self.analysis_type.parse()
    }

    pub fn to_analysis_config(&self) -> Result<AnalysisConfig> {
        let mode = self.analysis_mode()?;
        let mut analysis = match mode {
            AnalysisMode::Transient => AnalysisConfig::transient(),
            AnalysisMode::Ac => {
                let ac = &self.ac_settings;
                AnalysisConfig::ac(AcSettings {
                    sweep: sweep(&ac.sweep_type, ac.points, ac.start_frequency, ac.stop_frequency)?,
                    response: AcResponse::from_alias(ac.response.as_deref().unwrap_or("magnitude")),
                })
            }
            AnalysisMode::Noise => {
                let noise = &self.noise_settings;
                AnalysisConfig::noise(NoiseSettings {
                    sweep: sweep(&noise.sweep_type, noise.points, noise.start_frequency, noise.stop_frequency)?,
                    quantity: NoiseQuantity::from_alias(noise.quantity.as_deref().unwrap_or("onoise")),
                    output_node: noise.output_node.trim().to_string(),
                    source: noise.input_source.trim().to_string(),
                })
            }
        };

        if let Some(x) = self.x_parameter.as_deref().map(str::trim).filter(|x| !x.is_empty()) {
            analysis.x_variable = x.to_uppercase();
        }
        Ok(analysis.with_y_units(&self.y_units))
    }

    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            xtol: self.xtol,
            gtol: self.gtol,
            ftol: self.ftol,
            max_evaluations: self.max_evaluations,
            ..SolverConfig::default()
        }
    }

    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            executable: self.simulator.clone(),
            ..SimulatorConfig::default()
        }
    }

    /// Explicit `runs_root`, else `$SPICEFIT_WORKSPACE/runs`, else `runs`
    pub fn resolved_runs_root(&self) -> PathBuf {
        if let Some(root) = &self.runs_root {
            return root.clone();
        }
        match std::env::var_os(WORKSPACE_ENV) {
            Some(workspace) if !workspace.is_empty() => PathBuf::from(workspace).join(DEFAULT_RUNS_DIR),
            _ => PathBuf::from(DEFAULT_RUNS_DIR),
        }
    }

    pub fn target_curve(&self) -> Result<Curve> {
        if !self.target.is_empty() {
            return Curve::from_rows(&self.target);
        }
        match &self.target_csv {
            Some(path) => Curve::from_rows(&read_target_csv(path)?),
            None => Err(FitError::Config("job has no target curve".to_string())),
        }
    }

    /// Parse the netlist, mark the selected components and build the job
    pub fn to_job(&self) -> Result<OptimizationJob> {
        let netlist_text = fs::read_to_string(&self.netlist)?;
        let mut netlist = SpiceParser::new().parse_netlist(&netlist_text, &self.netlist);
        if netlist.components.is_empty() {
            return Err(FitError::Config(format!(
                "no components found in {}",
                self.netlist.display()
            )));
        }

        for name in &self.selected_parameters {
            match netlist.component_mut(name) {
                Some(component) => {
                    component.variable = true;
                    if let Some(bounds) = self.bounds.get(name) {
                        component.min_value = bounds.min;
                        component.max_value = bounds.max;
                    }
                }
                None => warn!("Selected parameter {} is not a component of the netlist", name),
            }
        }
        debug!(
            "{} of {} components selected for optimization",
            netlist.variable_indices().len(),
            netlist.components.len()
        );

        Ok(OptimizationJob {
            netlist,
            netlist_text,
            target: self.target_curve()?,
            y_parameter: self.y_parameter.clone(),
            analysis: self.to_analysis_config()?,
            constraints: self.constraints.clone(),
            solver: self.solver_config(),
            default_bounds: self.default_bounds,
            runs_root: self.resolved_runs_root(),
        })
    }
}

/// First two numeric columns of every row; header and malformed rows are skipped
pub fn read_target_csv(path: &Path) -> Result<Vec<[f64; 2]>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let x = record.get(0).and_then(|v| v.parse::<f64>().ok());
        let y = record.get(1).and_then(|v| v.parse::<f64>().ok());
        if let (Some(x), Some(y)) = (x, y) {
            rows.push([x, y]);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"{
        "netlist": "divider.cir",
        "target": [[0.0, 4.0], [1e-3, 4.0]],
        "y_parameter": "V(2)",
        "selected_parameters": ["R2"],
        "constraints": [
            {"type": "node", "left": "V(2)", "operator": "<=", "right": 4.1}
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = JobConfig::from_json(JOB).unwrap();
        assert_eq!(config.xtol, 1e-12);
        assert_eq!(config.ftol, 1e-12);
        assert_eq!(config.simulator, "Xyce");
        assert_eq!(config.constraints.len(), 1);

        let analysis = config.to_analysis_config().unwrap();
        assert_eq!(analysis.mode, AnalysisMode::Transient);
        assert_eq!(analysis.x_variable, "TIME");
        assert_eq!(config.solver_config().gtol, 1e-12);
    }

    #[test]
    fn test_ac_settings_and_units() {
        let config = JobConfig::from_json(
            r#"{
                "netlist": "rc.cir",
                "analysis_type": "AC",
                "y_units": "dB",
                "ac_settings": {"sweep_type": "lin", "points": 25, "start_frequency": 10.0, "response": "mag"}
            }"#,
        )
        .unwrap();
        let analysis = config.to_analysis_config().unwrap();
        assert_eq!(analysis.mode, AnalysisMode::Ac);
        assert_eq!(analysis.ac.response, AcResponse::MagnitudeDb);
        assert_eq!(analysis.ac.sweep.sweep, SweepType::Lin);
        assert_eq!(analysis.ac.sweep.points, 25);
        assert_eq!(analysis.x_variable, "FREQ");
        assert!(analysis.converts_to_db());
    }

    #[test]
    fn test_noise_settings_aliases() {
        let config = JobConfig::from_json(
            r#"{
                "netlist": "amp.cir",
                "analysis_type": "noise",
                "noise_settings": {"sweep": "oct", "points_per_decade": 5, "quantity": "INOISE", "output_node": "out", "source": "VIN"}
            }"#,
        )
        .unwrap();
        let analysis = config.to_analysis_config().unwrap();
        assert_eq!(analysis.noise.quantity, NoiseQuantity::Input);
        assert_eq!(analysis.noise.source, "VIN");
        assert_eq!(analysis.noise.sweep.points, 5);
        assert_eq!(analysis.target_observable(""), "INOISE");
    }

    #[test]
    fn test_unknown_analysis_type() {
        let config = JobConfig::from_json(r#"{"netlist": "x.cir", "analysis_type": "dc"}"#).unwrap();
        assert!(config.to_analysis_config().is_err());
    }

    #[test]
    fn test_target_csv_and_job() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("divider.cir"),
            "divider\nV1 1 0 10\nR1 1 2 1k\nR2 2 0 1k\n.END\n",
        )
        .unwrap();
        fs::write(dir.path().join("target.csv"), "time,v\n0,4\n0.001,4\nbad,row\n").unwrap();
        let job_path = dir.path().join("job.json");
        fs::write(
            &job_path,
            r#"{"netlist": "divider.cir", "target_csv": "target.csv", "y_parameter": "V(2)",
                "selected_parameters": ["r2", "R9"], "bounds": {"r2": {"min": 10.0}}, "runs_root": "out"}"#,
        )
        .unwrap();

        let config = JobConfig::load(&job_path).unwrap();
        assert_eq!(config.resolved_runs_root(), dir.path().join("out"));

        let job = config.to_job().unwrap();
        assert_eq!(job.target.x, vec![0.0, 0.001]);
        let r2 = job.netlist.component("R2").unwrap();
        assert!(r2.variable);
        assert_eq!(r2.min_value, Some(10.0));
        assert_eq!(job.netlist.variable_indices().len(), 1);
    }

    #[test]
    fn test_missing_target() {
        let config = JobConfig::from_json(r#"{"netlist": "x.cir"}"#).unwrap();
        assert!(config.target_curve().is_err());
    }
}
