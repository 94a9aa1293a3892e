//! Analysis configuration: transient, AC and noise settings, observable
//! naming and the analysis statement derived from a target curve.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Lowest frequency an AC or noise sweep may start at.
pub const MIN_SWEEP_FREQ: f64 = 1e-12;

/// Floor applied before taking a logarithm in dB conversion.
pub const DB_FLOOR: f64 = 1e-30;

lazy_static! {
    static ref VOLTAGE_PROBE: Regex = Regex::new(r"(?i)^v\s*\((.+)\)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Transient,
    Ac,
    Noise,
}

impl AnalysisMode {
    pub fn default_x_variable(&self) -> &'static str {
        match self {
            AnalysisMode::Transient => "TIME",
            AnalysisMode::Ac | AnalysisMode::Noise => "FREQ",
        }
    }

    /// Keyword used in `.PRINT <keyword> ...`
    pub fn print_keyword(&self) -> &'static str {
        match self {
            AnalysisMode::Transient => "TRAN",
            AnalysisMode::Ac => "AC",
            AnalysisMode::Noise => "NOISE",
        }
    }
}

impl FromStr for AnalysisMode {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "transient" | "tran" => Ok(AnalysisMode::Transient),
            "ac" => Ok(AnalysisMode::Ac),
            "noise" => Ok(AnalysisMode::Noise),
            other => Err(FitError::Config(format!("unknown analysis type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SweepType {
    #[default]
    Dec,
    Lin,
    Oct,
}

impl FromStr for SweepType {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "DEC" => Ok(SweepType::Dec),
            "LIN" => Ok(SweepType::Lin),
            "OCT" => Ok(SweepType::Oct),
            other => Err(FitError::InvalidDirective(format!(
                "sweep type '{}' is not one of DEC, LIN, OCT",
                other
            ))),
        }
    }
}

impl fmt::Display for SweepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            SweepType::Dec => "DEC",
            SweepType::Lin => "LIN",
            SweepType::Oct => "OCT",
        };
        f.write_str(keyword)
    }
}

/// Which part of a complex AC response is fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcResponse {
    #[default]
    Magnitude,
    MagnitudeDb,
    Phase,
    Real,
    Imaginary,
}

impl AcResponse {
    /// Map a user-facing alias; unknown aliases fall back to magnitude.
    pub fn from_alias(alias: &str) -> Self {
        match alias.trim().to_lowercase().as_str() {
            "db" | "magnitude_db" => AcResponse::MagnitudeDb,
            "phase" | "angle" => AcResponse::Phase,
            "real" => AcResponse::Real,
            "imag" | "imaginary" => AcResponse::Imaginary,
            _ => AcResponse::Magnitude,
        }
    }

    /// Output-variable prefix that selects this response from a node voltage
    pub fn probe_prefix(&self) -> &'static str {
        match self {
            AcResponse::Magnitude | AcResponse::MagnitudeDb => "VM",
            AcResponse::Phase => "VP",
            AcResponse::Real => "VR",
            AcResponse::Imaginary => "VI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoiseQuantity {
    #[default]
    Output,
    OutputDb,
    Input,
    InputDb,
}

impl NoiseQuantity {
    pub fn from_alias(alias: &str) -> Self {
        match alias.trim().to_lowercase().as_str() {
            "onoise_db" => NoiseQuantity::OutputDb,
            "inoise" => NoiseQuantity::Input,
            "inoise_db" => NoiseQuantity::InputDb,
            _ => NoiseQuantity::Output,
        }
    }

    pub fn is_db(&self) -> bool {
        matches!(self, NoiseQuantity::OutputDb | NoiseQuantity::InputDb)
    }

    pub fn to_db(self) -> Self {
        match self {
            NoiseQuantity::Output | NoiseQuantity::OutputDb => NoiseQuantity::OutputDb,
            NoiseQuantity::Input | NoiseQuantity::InputDb => NoiseQuantity::InputDb,
        }
    }

    pub fn observable(&self) -> &'static str {
        match self {
            NoiseQuantity::Output | NoiseQuantity::OutputDb => "ONOISE",
            NoiseQuantity::Input | NoiseQuantity::InputDb => "INOISE",
        }
    }
}

/// Frequency sweep shared by AC and noise analyses. Unset or invalid
/// endpoints are derived from the target curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    pub sweep: SweepType,
    pub points: usize,
    pub start: Option<f64>,
    pub stop: Option<f64>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            sweep: SweepType::Dec,
            points: 10,
            start: None,
            stop: None,
        }
    }
}

impl SweepSettings {
    /// Fill in missing endpoints from the target x-range
    pub fn resolve(&self, target_xs: &[f64]) -> (f64, f64) {
        let range = x_range(target_xs);

        let start = match self.start {
            Some(start) if start > 0.0 => start,
            _ => range.map_or(MIN_SWEEP_FREQ, |(min, _)| min.max(MIN_SWEEP_FREQ)),
        };

        let stop = match self.stop {
            Some(stop) if stop > start => stop,
            _ => {
                let candidate = range.map_or(start * 10.0, |(_, max)| max.max(start * 10.0));
                if candidate <= start {
                    start * 10.0
                } else {
                    candidate
                }
            }
        };

        (start, stop)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcSettings {
    pub sweep: SweepSettings,
    pub response: AcResponse,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseSettings {
    pub sweep: SweepSettings,
    pub quantity: NoiseQuantity,
    pub output_node: String,
    pub source: String,
}

/// The analysis statement inserted into the working netlist
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisDirective {
    Transient {
        step: f64,
        stop: f64,
        start: f64,
        max_step: f64,
    },
    Ac {
        sweep: SweepType,
        points: usize,
        start: f64,
        stop: f64,
    },
    Noise {
        output: String,
        source: String,
        sweep: SweepType,
        points: usize,
        start: f64,
        stop: f64,
    },
}

impl AnalysisDirective {
    pub fn mode(&self) -> AnalysisMode {
        match self {
            AnalysisDirective::Transient { .. } => AnalysisMode::Transient,
            AnalysisDirective::Ac { .. } => AnalysisMode::Ac,
            AnalysisDirective::Noise { .. } => AnalysisMode::Noise,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub mode: AnalysisMode,
    /// Result-table column used as the x-axis.
    pub x_variable: String,
    pub ac: AcSettings,
    pub noise: NoiseSettings,
}

impl AnalysisConfig {
    pub fn transient() -> Self {
        AnalysisConfig {
            mode: AnalysisMode::Transient,
            x_variable: AnalysisMode::Transient.default_x_variable().to_string(),
            ..Default::default()
        }
    }

    pub fn ac(settings: AcSettings) -> Self {
        AnalysisConfig {
            mode: AnalysisMode::Ac,
            x_variable: AnalysisMode::Ac.default_x_variable().to_string(),
            ac: settings,
            ..Default::default()
        }
    }

    pub fn noise(settings: NoiseSettings) -> Self {
        AnalysisConfig {
            mode: AnalysisMode::Noise,
            x_variable: AnalysisMode::Noise.default_x_variable().to_string(),
            noise: settings,
            ..Default::default()
        }
    }

    /// Let the target curve's y-units force dB or phase fitting
    pub fn with_y_units(mut self, y_units: &str) -> Self {
        let units = y_units.to_lowercase();
        match self.mode {
            AnalysisMode::Ac if units.contains("db") => self.ac.response = AcResponse::MagnitudeDb,
            AnalysisMode::Ac if units.contains("phase") => self.ac.response = AcResponse::Phase,
            AnalysisMode::Noise if units.contains("db") => {
                self.noise.quantity = self.noise.quantity.to_db()
            }
            _ => {}
        }
        self
    }

    /// True when both the target and simulated curves are compared in dB
    pub fn converts_to_db(&self) -> bool {
        match self.mode {
            AnalysisMode::Transient => false,
            AnalysisMode::Ac => self.ac.response == AcResponse::MagnitudeDb,
            AnalysisMode::Noise => self.noise.quantity.is_db(),
        }
    }

    /// Canonical output-variable name for `token` under this analysis.
    ///
    /// For AC a bare `V(node)` picks up the response prefix (`VM`, `VP`,
    /// `VR`, `VI`); everything else is upper-cased as-is.
    pub fn normalize_observable(&self, token: &str) -> String {
        let token = token.trim();
        if token.is_empty() {
            return String::new();
        }
        if self.mode != AnalysisMode::Ac {
            return token.to_uppercase();
        }

        let lowered = token.to_lowercase();
        if ["vm(", "vp(", "vr(", "vi("].iter().any(|p| lowered.starts_with(p)) {
            return token.to_uppercase();
        }
        match VOLTAGE_PROBE.captures(token) {
            Some(captures) => format!(
                "{}({})",
                self.ac.response.probe_prefix(),
                captures[1].trim().to_uppercase()
            ),
            None => token.to_uppercase(),
        }
    }

    /// Observable fitted against the target curve
    pub fn target_observable(&self, y_parameter: &str) -> String {
        if self.mode == AnalysisMode::Noise && y_parameter.trim().is_empty() {
            return self.noise.quantity.observable().to_string();
        }
        self.normalize_observable(y_parameter)
    }

    /// Build the analysis statement covering the target x-range
    pub fn directive(&self, target_xs: &[f64]) -> Result<AnalysisDirective> {
        match self.mode {
            AnalysisMode::Transient => {
                let (start, stop) = x_range(target_xs).unwrap_or((0.0, 0.0));
                let span = stop - start;
                let step = if span == 0.0 {
                    if stop != 0.0 {
                        stop.abs().max(1e-9) / 100.0
                    } else {
                        1e-9
                    }
                } else {
                    span.abs() / 100.0
                };
                Ok(AnalysisDirective::Transient {
                    step,
                    stop,
                    start,
                    max_step: step,
                })
            }
            AnalysisMode::Ac => {
                let (start, stop) = self.ac.sweep.resolve(target_xs);
                Ok(AnalysisDirective::Ac {
                    sweep: self.ac.sweep.sweep,
                    points: self.ac.sweep.points,
                    start,
                    stop,
                })
            }
            AnalysisMode::Noise => {
                let node = self.noise.output_node.trim();
                if node.is_empty() {
                    return Err(FitError::InvalidDirective(
                        "noise analysis requires an output node".to_string(),
                    ));
                }
                let source = self.noise.source.trim();
                if source.is_empty() {
                    return Err(FitError::InvalidDirective(
                        "noise analysis requires an input source".to_string(),
                    ));
                }
                let output = if node.to_uppercase().starts_with("V(") {
                    node.to_string()
                } else {
                    format!("V({})", node)
                };
                let (start, stop) = self.noise.sweep.resolve(target_xs);
                Ok(AnalysisDirective::Noise {
                    output,
                    source: source.to_uppercase(),
                    sweep: self.noise.sweep.sweep,
                    points: self.noise.sweep.points,
                    start,
                    stop,
                })
            }
        }
    }
}

fn x_range(xs: &[f64]) -> Option<(f64, f64)> {
    if xs.is_empty() {
        return None;
    }
    let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((min, max))
}

/// Linear magnitude to dB, floored so zero never reaches the logarithm
pub fn linear_to_db(value: f64) -> f64 {
    20.0 * value.max(DB_FLOOR).log10()
}

pub fn to_db(values: &[f64]) -> Vec<f64> {
    values.iter().map(|&v| linear_to_db(v)).collect()
}
