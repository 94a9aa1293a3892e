//! One evaluate-and-compare cycle per parameter vector requested by the solver.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use log::debug;

use crate::analysis::{to_db, AnalysisConfig};
use crate::circuit::{Netlist, ValueOverlay};
use crate::constraints::{reapply_equalities, EqualityBinding, NodeConstraint, PenaltyPolicy};
use crate::error::{FitError, Result};
use crate::events::{Event, EventSink};
use crate::output::{OutputResolver, ResultTable};
use crate::session::{RunRecord, RETAINED_RUNS};
use crate::simulator::{LineDisposition, SimulationBackend, SimulationOutput};
use crate::writer::{write_text, NetlistWriter};

/// Sampled curve sorted by x, linearly interpolated and clamped at both ends
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Curve {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Curve {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        let mut points: Vec<(f64, f64)> = x.into_iter().zip(y).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (x, y) = points.into_iter().unzip();
        Curve { x, y }
    }

    pub fn from_rows(rows: &[[f64; 2]]) -> Result<Self> {
        if rows.is_empty() {
            return Err(FitError::Config("target curve has no rows".to_string()));
        }
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(FitError::Config("target curve contains non-finite values".to_string()));
        }
        Ok(Curve::new(
            rows.iter().map(|row| row[0]).collect(),
            rows.iter().map(|row| row[1]).collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn to_db(&self) -> Curve {
        Curve {
            x: self.x.clone(),
            y: to_db(&self.y),
        }
    }

    pub fn at(&self, x: f64) -> f64 {
        let n = self.x.len();
        if n == 0 {
            return f64::NAN;
        }
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[n - 1] {
            return self.y[n - 1];
        }

        let upper = self.x.partition_point(|&xi| xi <= x);
        let (x0, x1) = (self.x[upper - 1], self.x[upper]);
        let (y0, y1) = (self.y[upper - 1], self.y[upper]);
        if x1 == x0 {
            return y0;
        }
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }

    pub fn sample(&self, grid: &[f64]) -> Vec<f64> {
        grid.iter().map(|&x| self.at(x)).collect()
    }
}

/// Everything an evaluation needs that does not change during the solve
pub struct ResidualContext<'a> {
    pub template: &'a Netlist,
    /// Template text with the analysis statements already inserted.
    pub base_text: &'a str,
    pub working_path: PathBuf,
    pub variable_indices: Vec<usize>,
    pub equalities: &'a [EqualityBinding],
    pub node_constraints: &'a [NodeConstraint],
    /// Target curve, already in the units the simulated curve is compared in.
    pub target: &'a Curve,
    pub observable: &'a str,
    pub analysis: &'a AnalysisConfig,
    pub backend: &'a dyn SimulationBackend,
    pub resolver: &'a OutputResolver,
    pub penalty: &'a dyn PenaltyPolicy,
    pub events: &'a dyn EventSink,
}

/// Residual function handed to the least-squares solver.
///
/// The interpolation grid is the simulator's x-axis from the first
/// evaluation and stays fixed for the rest of the solve.
pub struct ResidualEvaluator<'a> {
    ctx: ResidualContext<'a>,
    writer: NetlistWriter,
    grid: Option<Vec<f64>>,
    invocations: usize,
    records: VecDeque<RunRecord>,
    last_overlay: ValueOverlay,
}

impl<'a> ResidualEvaluator<'a> {
    pub fn new(ctx: ResidualContext<'a>) -> Self {
        ResidualEvaluator {
            ctx,
            writer: NetlistWriter::new(),
            grid: None,
            invocations: 0,
            records: VecDeque::with_capacity(RETAINED_RUNS),
            last_overlay: ValueOverlay::new(),
        }
    }

    /// Simulator invocations so far
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn grid(&self) -> Option<&[f64]> {
        self.grid.as_deref()
    }

    /// Values written for the most recent evaluation, equalities included
    pub fn last_overlay(&self) -> &ValueOverlay {
        &self.last_overlay
    }

    /// The most recent run records, oldest first
    pub fn take_records(&mut self) -> Vec<RunRecord> {
        self.records.drain(..).collect()
    }

    /// Overlay for a solver vector with equality constraints re-applied
    pub fn overlay_for(&self, values: &[f64]) -> Result<ValueOverlay> {
        if values.len() != self.ctx.variable_indices.len() {
            return Err(FitError::Solver(format!(
                "expected {} parameter values, got {}",
                self.ctx.variable_indices.len(),
                values.len()
            )));
        }
        let mut overlay = ValueOverlay::new();
        for (&index, &value) in self.ctx.variable_indices.iter().zip(values) {
            overlay.set(index, value);
        }
        reapply_equalities(self.ctx.equalities, self.ctx.template, &mut overlay)?;
        Ok(overlay)
    }

    pub fn evaluate(&mut self, values: &[f64]) -> Result<Vec<f64>> {
        self.invocations += 1;
        let mut record = RunRecord::new(self.invocations);
        let result = self.run(values, &mut record);
        if let Err(e) = &result {
            let message = format!("Run #{} failed: {}", record.number, e);
            self.log(&mut record, message);
        }
        if self.records.len() == RETAINED_RUNS {
            self.records.pop_front();
        }
        self.records.push_back(record);
        result
    }

    fn log(&self, record: &mut RunRecord, message: String) {
        self.ctx.events.send(Event::Log(message.clone()));
        record.push(message);
    }

    fn run(&mut self, values: &[f64], record: &mut RunRecord) -> Result<Vec<f64>> {
        let overlay = self.overlay_for(values)?;
        let text = self.writer.render(self.ctx.template, self.ctx.base_text, &overlay);
        write_text(&self.ctx.working_path, &text)?;
        self.last_overlay = overlay;

        let run = self.invocations;
        let name = self.ctx.backend.name().to_string();
        let path = self.ctx.working_path.clone();
        self.log(record, format!("Run #{} - Starting {} simulation", run, name));
        self.log(record, format!("Netlist file: {}", path.display()));
        self.log(record, "Component values:".to_string());
        let current = self.ctx.template.values_with(&self.last_overlay);
        for (index, (component, value)) in self.ctx.template.components.iter().zip(&current).enumerate() {
            let changed = self.last_overlay.get(index).is_some();
            self.log(
                record,
                format!(
                    "  {}: {} (variable={}, modified={})",
                    component.name, value, component.variable, changed || component.modified
                ),
            );
        }

        self.ctx.resolver.clear_stale(&path)?;
        let output = self.ctx.backend.run(&path)?;
        self.forward_output(record, &name, &output);

        self.log(record, format!("Attempting to parse output for {}", path.display()));
        let table = self.ctx.resolver.read(&path, self.ctx.analysis.mode)?;
        self.log(
            record,
            format!(
                "Successfully parsed {}. Found {} data points",
                table.path.display(),
                table.rows.len()
            ),
        );

        self.compare(&table)
    }

    fn forward_output(&self, record: &mut RunRecord, name: &str, output: &SimulationOutput) {
        for (label, text) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            self.log(record, format!("{} {}:", name, label));
            for (line, disposition) in SimulationOutput::classified(text) {
                let line = format!("  {}", line);
                match disposition {
                    LineDisposition::Record => self.log(record, line),
                    LineDisposition::ForwardOnly => self.ctx.events.send(Event::Log(line)),
                }
            }
        }
    }

    fn compare(&mut self, table: &ResultTable) -> Result<Vec<f64>> {
        let xs = table.column(table.x_column(&self.ctx.analysis.x_variable));
        let mut ys = table.series(self.ctx.observable)?;
        if self.ctx.analysis.converts_to_db() {
            ys = to_db(&ys);
        }

        let grid = match &self.grid {
            Some(grid) => grid.clone(),
            None => {
                let mut grid = xs.clone();
                grid.sort_by(f64::total_cmp);
                debug!("Fixed interpolation grid: {} points", grid.len());
                self.grid = Some(grid.clone());
                grid
            }
        };

        self.ctx
            .events
            .send(Event::Update(format!("total runs completed: {}", self.invocations)));
        self.ctx.events.send(Event::UpdateYData {
            x: xs.clone(),
            y: ys.clone(),
        });

        let simulated = Curve::new(xs.clone(), ys);
        let residual: Vec<f64> = self
            .ctx
            .target
            .sample(&grid)
            .into_iter()
            .zip(simulated.sample(&grid))
            .map(|(target, sim)| target - sim)
            .collect();

        let mut worst: Option<f64> = None;
        for constraint in self.ctx.node_constraints {
            let values = table.series(&constraint.observable)?;
            if let Some(excess) = constraint.violation(&xs, &values) {
                debug!("Node constraint on {} breached by {:e}", constraint.observable, excess);
                worst = Some(worst.map_or(excess, |w: f64| w.max(excess)));
            }
        }

        match worst {
            Some(excess) => Ok(self.ctx.penalty.penalize(residual, excess)),
            None => Ok(residual),
        }
    }

    pub fn working_path(&self) -> &Path {
        &self.ctx.working_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    use crate::constraints::{ConstantPenalty, NodeWindow, DEFAULT_PENALTY};
    use crate::events::CollectingSink;
    use crate::parser::SpiceParser;

    const DIVIDER: &str = "divider\nV1 1 0 10\nR1 1 2 6k\nR2 2 0 1k\n.TRAN 1u 1m\n.PRINT TRAN V(2)\n.END\n";

    /// Writes a flat `V(2)` table over `points` evenly spaced times up to 1 ms
    struct FlatBackend {
        level: Cell<f64>,
        points: Cell<usize>,
    }

    impl SimulationBackend for FlatBackend {
        fn run(&self, netlist: &Path) -> Result<SimulationOutput> {
            let points = self.points.get();
            let mut table = String::from("Index,TIME,V(2)\n");
            for i in 0..points {
                let t = 1e-3 * i as f64 / (points - 1) as f64;
                table.push_str(&format!("{},{},{}\n", i, t, self.level.get()));
            }
            let mut out = netlist.as_os_str().to_os_string();
            out.push(".prn");
            fs::write(out, table)?;
            Ok(SimulationOutput::default())
        }
    }

    #[test]
    fn test_breach_penalizes_whole_residual() {
        let dir = tempfile::tempdir().unwrap();
        let template = SpiceParser::new().parse_netlist(DIVIDER, "divider.cir");
        let r2 = template.component_index("R2").unwrap();
        let target = Curve::from_rows(&[[0.0, 4.0], [1e-3, 4.0]]).unwrap();
        let analysis = AnalysisConfig::transient();
        let nodes = vec![NodeConstraint {
            observable: "V(2)".to_string(),
            windows: vec![NodeWindow {
                upper: Some(4.1),
                ..NodeWindow::default()
            }],
        }];
        let backend = FlatBackend {
            level: Cell::new(4.5),
            points: Cell::new(3),
        };
        let resolver = OutputResolver::default();
        let penalty = ConstantPenalty::default();
        let sink = CollectingSink::new();

        let mut evaluator = ResidualEvaluator::new(ResidualContext {
            template: &template,
            base_text: DIVIDER,
            working_path: dir.path().join("optimized.txt"),
            variable_indices: vec![r2],
            equalities: &[],
            node_constraints: &nodes,
            target: &target,
            observable: "V(2)",
            analysis: &analysis,
            backend: &backend,
            resolver: &resolver,
            penalty: &penalty,
            events: &sink,
        });

        let breached = evaluator.evaluate(&[2000.0]).unwrap();
        assert_eq!(breached, vec![DEFAULT_PENALTY; 3]);
        assert_eq!(evaluator.grid(), Some(&[0.0, 5e-4, 1e-3][..]));
        let written = fs::read_to_string(evaluator.working_path()).unwrap();
        assert!(written.contains("R2 2 0 2000"));

        // a finer table is still compared on the grid from the first run
        backend.level.set(3.9);
        backend.points.set(5);
        let residual = evaluator.evaluate(&[1500.0]).unwrap();
        assert_eq!(residual.len(), 3);
        assert!(residual.iter().all(|r| (r - 0.1).abs() < 1e-12));

        assert_eq!(evaluator.invocations(), 2);
        assert_eq!(evaluator.take_records().len(), 2);
        assert!(sink
            .events()
            .contains(&Event::Update("total runs completed: 2".to_string())));
    }

    #[test]
    fn test_curve_interpolation_clamps() {
        let curve = Curve::new(vec![2.0, 0.0, 1.0], vec![20.0, 0.0, 10.0]);
        assert_eq!(curve.x, vec![0.0, 1.0, 2.0]);
        assert_eq!(curve.at(0.5), 5.0);
        assert_eq!(curve.at(1.75), 17.5);
        assert_eq!(curve.at(-1.0), 0.0);
        assert_eq!(curve.at(3.0), 20.0);
        assert_eq!(curve.sample(&[0.0, 2.0]), vec![0.0, 20.0]);
    }

    #[test]
    fn test_curve_with_repeated_x() {
        let curve = Curve::new(vec![0.0, 1.0, 1.0, 2.0], vec![0.0, 1.0, 3.0, 3.0]);
        assert!(curve.at(1.0).is_finite());
        assert_eq!(curve.at(1.5), 3.0);
    }

    #[test]
    fn test_target_rows() {
        assert!(Curve::from_rows(&[]).is_err());
        assert!(Curve::from_rows(&[[0.0, f64::NAN]]).is_err());

        let curve = Curve::from_rows(&[[0.0, 1.0], [1.0, 10.0]]).unwrap();
        let db = curve.to_db();
        assert_eq!(db.y, vec![0.0, 20.0]);
        assert_eq!(curve.len(), 2);
    }
}
