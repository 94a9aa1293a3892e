//! Drives one optimization session from job inputs to final component values.

use std::path::PathBuf;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisConfig;
use crate::circuit::{ElementClass, Netlist, ValueOverlay};
use crate::constraints::{
    ConstantPenalty, ConstraintKind, ConstraintRow, ConstraintSet, PenaltyPolicy,
};
use crate::error::{FitError, Result};
use crate::events::{Event, EventSink};
use crate::output::{FittedCurve, OutputResolver};
use crate::residual::{Curve, ResidualContext, ResidualEvaluator};
use crate::session::{RunRecord, Session, SessionHeader, SessionLogger};
use crate::simulator::SimulationBackend;
use crate::solver::{BoundedLeastSquares, LeastSquaresReport, SolverConfig};
use crate::writer::{strip_control_blocks, write_text, AnalysisDirectiveWriter, NetlistWriter};

/// Metrics reported for every session, successful or not.
///
/// `iterations` counts solver function evaluations, not Jacobian probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub simulator_runs: usize,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub optimality: f64,
}

impl OptimizationResult {
    pub fn as_tuple(&self) -> (usize, usize, f64, f64, f64) {
        (
            self.simulator_runs,
            self.iterations,
            self.initial_cost,
            self.final_cost,
            self.optimality,
        )
    }
}

/// Which element classes get `[value / 10, value * 10]` when no bound is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultBounds {
    #[serde(default)]
    pub resistor: bool,
    #[serde(default)]
    pub capacitor: bool,
    #[serde(default)]
    pub inductor: bool,
}

impl DefaultBounds {
    pub fn applies_to(&self, class: ElementClass) -> bool {
        match class {
            ElementClass::Resistor => self.resistor,
            ElementClass::Capacitor => self.capacitor,
            ElementClass::Inductor => self.inductor,
            _ => false,
        }
    }
}

/// Lower and upper bounds for each variable component
pub fn component_bounds(netlist: &Netlist, indices: &[usize], defaults: DefaultBounds) -> (Vec<f64>, Vec<f64>) {
    indices
        .iter()
        .map(|&index| {
            let component = &netlist.components[index];
            let widen = defaults.applies_to(component.class);
            let lower = component.min_value.unwrap_or(if widen {
                component.value / 10.0
            } else {
                0.0
            });
            let upper = component.max_value.unwrap_or(if widen {
                component.value * 10.0
            } else {
                f64::INFINITY
            });
            (lower, upper)
        })
        .unzip()
}

/// Fully resolved inputs of one optimization
#[derive(Debug, Clone)]
pub struct OptimizationJob {
    pub netlist: Netlist,
    /// Source text of `netlist`.
    pub netlist_text: String,
    /// Target curve in the units it was supplied in.
    pub target: Curve,
    pub y_parameter: String,
    pub analysis: AnalysisConfig,
    pub constraints: Vec<ConstraintRow>,
    pub solver: SolverConfig,
    pub default_bounds: DefaultBounds,
    pub runs_root: PathBuf,
}

impl OptimizationJob {
    fn header(&self) -> SessionHeader {
        let nodes: Vec<String> = self
            .constraints
            .iter()
            .filter(|row| row.kind == ConstraintKind::Node)
            .map(|row| format!("{} {} {}", row.left, row.operator, row.right.as_text()))
            .collect();
        SessionHeader {
            target: self.y_parameter.clone(),
            netlist: self.netlist.path.clone(),
            node_constraints: if nodes.is_empty() {
                "none".to_string()
            } else {
                nodes.join("; ")
            },
            xtol: self.solver.xtol,
            gtol: self.solver.gtol,
            ftol: self.solver.ftol,
        }
    }
}

/// What a finished session leaves behind
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub result: OptimizationResult,
    /// Netlist carrying the final (or last attempted) values.
    pub netlist: Netlist,
    pub session: Option<Session>,
    pub report: Option<LeastSquaresReport>,
    pub curve: Option<FittedCurve>,
    pub error: Option<String>,
}

impl OptimizationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

struct SolveState {
    report: Option<LeastSquaresReport>,
    curve: Option<FittedCurve>,
    runs: usize,
    records: Vec<RunRecord>,
    last_values: ValueOverlay,
}

/// Runs sessions against a simulation backend, reporting to an event sink.
pub struct OptimizationDriver<'a> {
    backend: &'a dyn SimulationBackend,
    events: &'a dyn EventSink,
    resolver: OutputResolver,
    penalty: Box<dyn PenaltyPolicy>,
}

impl<'a> OptimizationDriver<'a> {
    pub fn new(backend: &'a dyn SimulationBackend, events: &'a dyn EventSink) -> Self {
        OptimizationDriver {
            backend,
            events,
            resolver: OutputResolver::default(),
            penalty: Box::new(ConstantPenalty::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: OutputResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_penalty(mut self, penalty: Box<dyn PenaltyPolicy>) -> Self {
        self.penalty = penalty;
        self
    }

    fn log(&self, logger: &mut Option<SessionLogger>, message: String) {
        info!("{}", message);
        if let Some(session) = logger.as_mut() {
            if let Err(e) = session.line(&message) {
                warn!("Failed to append to session log: {}", e);
            }
        }
        self.events.send(Event::Log(message));
    }

    /// Run one session. Never fails: errors are reported through the
    /// event sink and the outcome, with whatever metrics were gathered.
    pub fn optimize(&self, job: OptimizationJob) -> OptimizationOutcome {
        let header = job.header();
        for line in header.lines() {
            self.events.send(Event::Log(line));
        }

        let mut logger = match SessionLogger::start(&job.runs_root, &header) {
            Ok(logger) => Some(logger),
            Err(e) => {
                error!("Could not start session under {}: {}", job.runs_root.display(), e);
                None
            }
        };

        let mut netlist = job.netlist.clone();
        let mut state = SolveState {
            report: None,
            curve: None,
            runs: 0,
            records: Vec::new(),
            last_values: ValueOverlay::new(),
        };

        let session = logger.as_ref().map(|l| l.session().clone());
        let outcome = match &session {
            Some(session) => self.solve(&job, &mut netlist, session, &mut logger, &mut state),
            None => Err(FitError::Config(format!(
                "cannot create a session under {}",
                job.runs_root.display()
            ))),
        };

        if let Some(session) = logger.as_mut() {
            for record in state.records.drain(..) {
                session.push_run(record);
            }
        }

        let result = match &state.report {
            Some(report) => OptimizationResult {
                simulator_runs: state.runs,
                iterations: report.evaluations,
                initial_cost: report.initial_cost,
                final_cost: report.cost,
                optimality: report.optimality,
            },
            None => OptimizationResult {
                simulator_runs: state.runs,
                ..Default::default()
            },
        };

        let error = match outcome {
            Ok(()) => {
                self.report_success(&mut logger, &netlist, &result, state.report.as_ref());
                None
            }
            Err(e) => {
                let message = format!("Optimization failed with error: {}", e);
                error!("{}", message);
                if let Some(session) = logger.as_mut() {
                    if let Err(log_error) = session.line(&message) {
                        warn!("Failed to append to session log: {}", log_error);
                    }
                }
                // Show the values the failing run was trying
                for (index, value) in state.last_values.iter() {
                    if let Some(component) = netlist.components.get_mut(index) {
                        component.set_value(value);
                    }
                }
                self.events.send(Event::Failed(e.to_string()));
                self.events.send(Event::UpdateNetlist(Box::new(netlist.clone())));
                Some(e.to_string())
            }
        };

        if let Some(mut session_logger) = logger {
            session_logger.set_metrics(result);
            if let Err(e) = session_logger.finish() {
                error!("Failed to close session log: {}", e);
            }
        }

        OptimizationOutcome {
            result,
            netlist,
            session,
            report: state.report,
            curve: state.curve,
            error,
        }
    }

    fn solve(
        &self,
        job: &OptimizationJob,
        netlist: &mut Netlist,
        session: &Session,
        logger: &mut Option<SessionLogger>,
        state: &mut SolveState,
    ) -> Result<()> {
        let analysis = &job.analysis;
        let constraints = ConstraintSet::build(&job.constraints, netlist, analysis)?;

        let observable = analysis.target_observable(&job.y_parameter);
        if observable.is_empty() {
            return Err(FitError::Config("no target output variable given".to_string()));
        }
        let target = if analysis.converts_to_db() {
            job.target.to_db()
        } else {
            job.target.clone()
        };

        let directive = analysis.directive(&job.target.x)?;
        let print_vars = AnalysisDirectiveWriter::print_variables(&observable, &constraints.observables());
        let base_text = AnalysisDirectiveWriter::new().apply(
            &strip_control_blocks(&job.netlist_text),
            &directive,
            &print_vars,
        )?;

        let indices = netlist.variable_indices();
        if indices.is_empty() {
            return Err(FitError::Config("no variable components selected".to_string()));
        }
        let (lower, upper) = component_bounds(netlist, &indices, job.default_bounds);
        let x0: Vec<f64> = indices.iter().map(|&i| netlist.components[i].value).collect();

        self.log(
            logger,
            format!("Starting optimization with {} variable component(s)", indices.len()),
        );
        for ((&index, lo), hi) in indices.iter().zip(&lower).zip(&upper) {
            self.log(
                logger,
                format!("  {}: {} in [{}, {}]", netlist.components[index].name, netlist.components[index].value, lo, hi),
            );
        }
        self.log(logger, format!("Fitting {} against {} target point(s)", observable, target.len()));

        let template = netlist.clone();
        let mut evaluator = ResidualEvaluator::new(ResidualContext {
            template: &template,
            base_text: &base_text,
            working_path: session.working_netlist(),
            variable_indices: indices.clone(),
            equalities: &constraints.equalities,
            node_constraints: &constraints.nodes,
            target: &target,
            observable: &observable,
            analysis,
            backend: self.backend,
            resolver: &self.resolver,
            penalty: self.penalty.as_ref(),
            events: self.events,
        });

        let solver = BoundedLeastSquares::with_config(job.solver.clone());
        let solved = solver.minimize(|values| evaluator.evaluate(values), &x0, &lower, &upper);

        state.runs = evaluator.invocations();
        state.records = evaluator.take_records();
        state.last_values = evaluator.last_overlay().clone();
        let report = solved?;

        let final_values = evaluator.overlay_for(&report.x)?;
        if let Some(grid) = evaluator.grid() {
            let expected = target.sample(grid);
            let simulated = expected
                .iter()
                .zip(&report.residual)
                .map(|(t, r)| t - r)
                .collect();
            state.curve = Some(FittedCurve {
                observable: observable.clone(),
                x: grid.to_vec(),
                target: expected,
                simulated,
            });
        }
        drop(evaluator);

        for (index, value) in final_values.iter() {
            netlist.components[index].set_value(value);
        }
        let text = NetlistWriter::new().render(netlist, &base_text, &ValueOverlay::new());
        write_text(&session.working_netlist(), &text)?;

        self.log(logger, format!("Optimization finished: {}", report.termination.describe()));
        self.log(logger, "Final component values:".to_string());
        for &index in &indices {
            let component = &netlist.components[index];
            self.log(logger, format!("  {}: {}", component.name, component.value));
        }
        for binding in &constraints.equalities {
            let component = &netlist.components[binding.index];
            self.log(
                logger,
                format!("  {}: {} (= {})", component.name, component.value, binding.constraint.expression),
            );
        }

        state.report = Some(report);
        Ok(())
    }

    fn report_success(
        &self,
        logger: &mut Option<SessionLogger>,
        netlist: &Netlist,
        result: &OptimizationResult,
        report: Option<&LeastSquaresReport>,
    ) {
        self.events.send(Event::UpdateNetlist(Box::new(netlist.clone())));
        self.events.send(Event::UpdateOptimizationResults(*result));

        self.log(logger, "Optimization metrics:".to_string());
        self.log(logger, format!("  Total simulator runs: {}", result.simulator_runs));
        self.log(logger, format!("  Least squares iterations: {}", result.iterations));
        self.log(logger, format!("  Initial cost: {}", result.initial_cost));
        self.log(logger, format!("  Final cost: {}", result.final_cost));
        self.log(logger, format!("  Optimality: {}", result.optimality));
        if let Some(report) = report {
            self.log(logger, format!("  Solve time: {:.3}s", report.solve_time));
        }

        self.events.send(Event::Update(format!(
            "Optimization complete after {} simulator runs",
            result.simulator_runs
        )));
        self.events.send(Event::Update(format!(
            "Cost reduced from {:e} to {:e}",
            result.initial_cost, result.final_cost
        )));
        self.events.send(Event::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Component;

    #[test]
    fn test_component_bounds() {
        let mut netlist = Netlist::empty("bounds.cir");
        let mut r1 = Component::new("R1", ElementClass::Resistor, 1000.0, "1k");
        r1.variable = true;
        let mut c1 = Component::new("C1", ElementClass::Capacitor, 1e-9, "1n");
        c1.variable = true;
        c1.max_value = Some(5e-9);
        netlist.components = vec![r1, c1];

        let (lower, upper) = component_bounds(&netlist, &[0, 1], DefaultBounds::default());
        assert_eq!(lower, vec![0.0, 0.0]);
        assert_eq!(upper[0], f64::INFINITY);
        assert_eq!(upper[1], 5e-9);

        let defaults = DefaultBounds {
            resistor: true,
            capacitor: true,
            inductor: false,
        };
        let (lower, upper) = component_bounds(&netlist, &[0, 1], defaults);
        assert_eq!(lower, vec![100.0, 1e-10]);
        assert_eq!(upper, vec![10000.0, 5e-9]);
    }

    #[test]
    fn test_result_tuple_order() {
        let result = OptimizationResult {
            simulator_runs: 12,
            iterations: 4,
            initial_cost: 2.0,
            final_cost: 0.5,
            optimality: 1e-9,
        };
        assert_eq!(result.as_tuple(), (12, 4, 2.0, 0.5, 1e-9));
    }
}
