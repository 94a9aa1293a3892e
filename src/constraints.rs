//! Parameter and node constraints.
//!
//! Parameter constraints act on component values before and during the
//! solve; node constraints inspect simulated waveforms and turn a breach
//! into a penalty residual.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisConfig, AnalysisMode};
use crate::circuit::{Netlist, ValueOverlay};
use crate::error::{FitError, Result};
use crate::expr::evaluate;

/// Penalty value used for every sample when a node window is breached.
pub const DEFAULT_PENALTY: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    Equal,
    AtLeast,
    AtMost,
}

impl FromStr for Relation {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "=" | "==" => Ok(Relation::Equal),
            ">=" | "≥" => Ok(Relation::AtLeast),
            "<=" | "≤" => Ok(Relation::AtMost),
            other => Err(FitError::Config(format!("unknown constraint operator '{}'", other))),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Relation::Equal => "=",
            Relation::AtLeast => ">=",
            Relation::AtMost => "<=",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Parameter,
    Node,
}

/// A JSON scalar that may arrive as a string or a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn as_text(&self) -> String {
        match self {
            Scalar::Number(value) => value.to_string(),
            Scalar::Text(text) => text.trim().to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(value) => Some(*value),
            Scalar::Text(text) => text.trim().parse().ok(),
        }
    }
}

/// One constraint as written in a job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRow {
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    pub left: String,
    pub operator: String,
    pub right: Scalar,
    #[serde(default)]
    pub x_min: Option<Scalar>,
    #[serde(default)]
    pub x_max: Option<Scalar>,
}

/// `target <relation> expression` over component and parameter values
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConstraint {
    pub target: String,
    pub relation: Relation,
    pub expression: String,
}

impl ParameterConstraint {
    pub fn new(target: impl Into<String>, relation: Relation, expression: impl Into<String>) -> Self {
        ParameterConstraint {
            target: target.into(),
            relation,
            expression: expression.into(),
        }
    }

    pub fn from_row(row: &ConstraintRow) -> Result<Self> {
        Ok(ParameterConstraint {
            target: row.left.trim().to_string(),
            relation: row.operator.parse()?,
            expression: row.right.as_text(),
        })
    }
}

/// An equality constraint bound to the component index it drives
#[derive(Debug, Clone, PartialEq)]
pub struct EqualityBinding {
    pub index: usize,
    pub constraint: ParameterConstraint,
}

/// Expression namespace: parameters, then component values on top, keyed upper-case
pub fn namespace(netlist: &Netlist, values: &[f64]) -> HashMap<String, f64> {
    let mut names: HashMap<String, f64> = netlist.parameters.clone();
    for (component, &value) in netlist.components.iter().zip(values) {
        names.insert(component.name.to_uppercase(), value);
    }
    names
}

/// Apply a parameter constraint to the netlist. Returns the binding for
/// equality constraints, which must be re-applied on every evaluation.
pub fn apply_parameter_constraint(
    netlist: &mut Netlist,
    constraint: &ParameterConstraint,
) -> Result<Option<EqualityBinding>> {
    let Some(index) = netlist.component_index(&constraint.target) else {
        warn!("Constraint target '{}' is not a top-level component", constraint.target);
        return Ok(None);
    };

    let values: Vec<f64> = netlist.components.iter().map(|c| c.value).collect();
    let bound = evaluate(&constraint.expression, &namespace(netlist, &values))?;
    let component = &mut netlist.components[index];

    match constraint.relation {
        Relation::AtLeast => {
            component.min_value = Some(bound);
            if component.value < bound {
                component.set_value(bound + 0.01 * bound.abs());
            }
            info!("{} minimum set to {}", component.name, bound);
            Ok(None)
        }
        Relation::AtMost => {
            component.max_value = Some(bound);
            if component.value > bound {
                component.set_value(bound - 0.01 * bound.abs());
            }
            info!("{} maximum set to {}", component.name, bound);
            Ok(None)
        }
        Relation::Equal => {
            component.set_value(bound);
            component.variable = false;
            info!("{} fixed to {}", component.name, bound);
            Ok(Some(EqualityBinding {
                index,
                constraint: constraint.clone(),
            }))
        }
    }
}

/// Re-evaluate equality constraints in order against the overlaid values.
///
/// Each result is visible to the constraints after it.
pub fn reapply_equalities(
    bindings: &[EqualityBinding],
    netlist: &Netlist,
    overlay: &mut ValueOverlay,
) -> Result<()> {
    if bindings.is_empty() {
        return Ok(());
    }
    let mut names = namespace(netlist, &netlist.values_with(overlay));
    for binding in bindings {
        let value = evaluate(&binding.constraint.expression, &names)?;
        overlay.set(binding.index, value);
        if let Some(component) = netlist.components.get(binding.index) {
            names.insert(component.name.to_uppercase(), value);
        }
    }
    Ok(())
}

/// Allowed range for an observable, optionally restricted to an x sub-range
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeWindow {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
}

impl NodeWindow {
    pub fn covers(&self, x: f64) -> bool {
        self.x_min.map_or(true, |min| x >= min) && self.x_max.map_or(true, |max| x <= max)
    }

    /// Distance outside the bounds at `(x, y)`, if the sample breaches the window
    pub fn excess(&self, x: f64, y: f64) -> Option<f64> {
        if !self.covers(x) {
            return None;
        }
        match (self.lower, self.upper) {
            (Some(lower), _) if y < lower => Some(lower - y),
            (_, Some(upper)) if y > upper => Some(y - upper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConstraint {
    pub observable: String,
    pub windows: Vec<NodeWindow>,
}

impl NodeConstraint {
    /// Largest breach over all samples and windows, `None` when satisfied
    pub fn violation(&self, xs: &[f64], ys: &[f64]) -> Option<f64> {
        let mut worst: Option<f64> = None;
        for (&x, &y) in xs.iter().zip(ys) {
            for window in &self.windows {
                if let Some(excess) = window.excess(x, y) {
                    worst = Some(worst.map_or(excess, |w| w.max(excess)));
                }
            }
        }
        worst
    }

    pub fn is_violated(&self, xs: &[f64], ys: &[f64]) -> bool {
        self.violation(xs, ys).is_some()
    }
}

/// Group node rows into per-observable window lists, in first-seen order
pub fn build_node_constraints(rows: &[ConstraintRow], analysis: &AnalysisConfig) -> Vec<NodeConstraint> {
    let mut constraints: Vec<NodeConstraint> = Vec::new();

    for row in rows.iter().filter(|row| row.kind == ConstraintKind::Node) {
        let observable = analysis.normalize_observable(&row.left);
        if observable.is_empty() {
            continue;
        }
        let Some(value) = row.right.as_number() else {
            debug!("Skipping node constraint on {}: bound '{}' is not numeric", observable, row.right.as_text());
            continue;
        };

        let (lower, upper) = match row.operator.trim() {
            ">=" | "≥" => (Some(value), None),
            "<=" | "≤" => (None, Some(value)),
            "=" | "==" => (Some(value), Some(value)),
            _ => (None, None),
        };
        let window = NodeWindow {
            lower,
            upper,
            x_min: row.x_min.as_ref().and_then(Scalar::as_number),
            x_max: row.x_max.as_ref().and_then(Scalar::as_number),
        };

        match constraints.iter_mut().find(|c| c.observable == observable) {
            Some(existing) => existing.windows.push(window),
            None => constraints.push(NodeConstraint {
                observable,
                windows: vec![window],
            }),
        }
    }

    constraints
}

/// Shapes the residual returned when a node constraint is breached.
pub trait PenaltyPolicy: Send + Sync {
    /// `residual` is the unpenalised difference on the fixed grid and
    /// `excess` the largest breach found across all node constraints.
    fn penalize(&self, residual: Vec<f64>, excess: f64) -> Vec<f64>;
}

/// Replace every sample with the same large value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantPenalty {
    pub value: f64,
}

impl Default for ConstantPenalty {
    fn default() -> Self {
        ConstantPenalty {
            value: DEFAULT_PENALTY,
        }
    }
}

impl PenaltyPolicy for ConstantPenalty {
    fn penalize(&self, residual: Vec<f64>, _excess: f64) -> Vec<f64> {
        vec![self.value; residual.len()]
    }
}

/// Everything the residual needs from the job's constraint rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintSet {
    pub equalities: Vec<EqualityBinding>,
    pub nodes: Vec<NodeConstraint>,
}

impl ConstraintSet {
    /// Apply parameter rows to `netlist` and collect node windows.
    /// Node constraints are dropped for noise analysis.
    pub fn build(rows: &[ConstraintRow], netlist: &mut Netlist, analysis: &AnalysisConfig) -> Result<Self> {
        let mut equalities = Vec::new();
        for row in rows.iter().filter(|row| row.kind == ConstraintKind::Parameter) {
            let constraint = ParameterConstraint::from_row(row)?;
            if let Some(binding) = apply_parameter_constraint(netlist, &constraint)? {
                equalities.push(binding);
            }
        }

        let mut nodes = build_node_constraints(rows, analysis);
        if analysis.mode == AnalysisMode::Noise && !nodes.is_empty() {
            info!("Node constraints are ignored during noise analysis");
            nodes.clear();
        }

        Ok(ConstraintSet { equalities, nodes })
    }

    /// Observables the simulator must print for the node checks
    pub fn observables(&self) -> Vec<String> {
        self.nodes.iter().map(|c| c.observable.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AcSettings;
    use crate::circuit::{Component, ElementClass};

    fn netlist() -> Netlist {
        let mut netlist = Netlist::empty("test.cir");
        let mut r1 = Component::new("R1", ElementClass::Resistor, 100.0, "100");
        r1.variable = true;
        let mut r2 = Component::new("R2", ElementClass::Resistor, 50.0, "50");
        r2.variable = true;
        netlist.components = vec![r1, r2];
        netlist.parameters.insert("SCALE".to_string(), 3.0);
        netlist
    }

    fn node_row(left: &str, operator: &str, right: f64, x_min: Option<f64>, x_max: Option<f64>) -> ConstraintRow {
        ConstraintRow {
            kind: ConstraintKind::Node,
            left: left.to_string(),
            operator: operator.to_string(),
            right: Scalar::Number(right),
            x_min: x_min.map(Scalar::Number),
            x_max: x_max.map(Scalar::Number),
        }
    }

    #[test]
    fn test_equality_binds_and_fixes_component() {
        let mut netlist = netlist();
        let constraint = ParameterConstraint::new("R2", Relation::Equal, "R1*2");
        let binding = apply_parameter_constraint(&mut netlist, &constraint)
            .unwrap()
            .unwrap();

        let r2 = netlist.component("R2").unwrap();
        assert_eq!(r2.value, 200.0);
        assert!(!r2.variable);
        assert!(r2.modified);
        assert_eq!(binding.index, 1);

        // R1 moves during the solve; R2 follows on every evaluation
        let mut overlay = ValueOverlay::new();
        overlay.set(0, 150.0);
        reapply_equalities(&[binding], &netlist, &mut overlay).unwrap();
        assert_eq!(overlay.get(1), Some(300.0));
        assert_eq!(netlist.component("R2").unwrap().value, 200.0);
        assert_eq!(netlist.variable_indices(), vec![0]);
    }

    #[test]
    fn test_equalities_apply_in_order() {
        let mut netlist = netlist();
        netlist.components.push(Component::new("R3", ElementClass::Resistor, 1.0, "1"));
        let first = apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("R2", Relation::Equal, "R1 + 1"))
            .unwrap()
            .unwrap();
        let second = apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("r3", Relation::Equal, "R2 * scale"))
            .unwrap()
            .unwrap();

        let mut overlay = ValueOverlay::new();
        overlay.set(0, 9.0);
        reapply_equalities(&[first, second], &netlist, &mut overlay).unwrap();
        assert_eq!(overlay.get(1), Some(10.0));
        assert_eq!(overlay.get(2), Some(30.0));
    }

    #[test]
    fn test_inequalities_set_bounds_and_nudge() {
        let mut netlist = netlist();
        apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("R1", Relation::AtLeast, "200")).unwrap();
        let r1 = netlist.component("R1").unwrap();
        assert_eq!(r1.min_value, Some(200.0));
        assert_eq!(r1.value, 202.0);
        assert!(r1.variable);

        apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("R2", Relation::AtMost, "R1")).unwrap();
        let r2 = netlist.component("R2").unwrap();
        assert_eq!(r2.max_value, Some(202.0));
        assert_eq!(r2.value, 50.0);
        assert!(!r2.modified);
    }

    #[test]
    fn test_unknown_target_is_skipped() {
        let mut netlist = netlist();
        let result = apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("C9", Relation::Equal, "1"));
        assert!(matches!(result, Ok(None)));

        let bad = apply_parameter_constraint(&mut netlist, &ParameterConstraint::new("R1", Relation::Equal, "R1 +"));
        assert!(matches!(bad, Err(FitError::Expression(_))));
    }

    #[test]
    fn test_window_only_checks_inside_x_range() {
        let constraint = NodeConstraint {
            observable: "V(2)".to_string(),
            windows: vec![NodeWindow {
                lower: None,
                upper: Some(5.0),
                x_min: Some(0.0),
                x_max: Some(1.0),
            }],
        };

        let xs = [0.0, 0.5, 1.0, 1.5, 2.0];
        assert!(!constraint.is_violated(&xs, &[1.0, 4.9, 5.0, 100.0, -100.0]));
        assert!(constraint.is_violated(&xs, &[1.0, 5.1, 5.0, 0.0, 0.0]));
        assert_eq!(constraint.violation(&xs, &[6.0, 7.5, 0.0, 50.0, 0.0]), Some(2.5));
    }

    #[test]
    fn test_node_rows_group_by_observable() {
        let analysis = AnalysisConfig::ac(AcSettings::default());
        let mut rows = vec![
            node_row("v(out)", "<=", 2.0, None, None),
            node_row("VM(OUT)", ">=", 0.5, Some(10.0), Some(100.0)),
            node_row("v(in)", "=", 1.0, None, None),
        ];
        rows.push(ConstraintRow {
            right: Scalar::Text("lots".to_string()),
            ..node_row("v(x)", "<=", 0.0, None, None)
        });

        let constraints = build_node_constraints(&rows, &analysis);
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].observable, "VM(OUT)");
        assert_eq!(constraints[0].windows.len(), 2);
        assert_eq!(constraints[0].windows[1].x_min, Some(10.0));
        assert_eq!(constraints[1].windows[0].lower, Some(1.0));
        assert_eq!(constraints[1].windows[0].upper, Some(1.0));
    }

    #[test]
    fn test_noise_drops_node_constraints() {
        let mut netlist = netlist();
        let analysis = AnalysisConfig::noise(Default::default());
        let rows = vec![node_row("V(2)", "<=", 1.0, None, None)];
        let set = ConstraintSet::build(&rows, &mut netlist, &analysis).unwrap();
        assert!(set.nodes.is_empty());
    }

    #[test]
    fn test_constant_penalty() {
        let penalty = ConstantPenalty::default();
        assert_eq!(penalty.penalize(vec![0.1, -0.2, 0.3], 4.0), vec![1e6; 3]);
    }

    #[test]
    fn test_rows_deserialize_from_json() {
        let rows: Vec<ConstraintRow> = serde_json::from_str(
            r#"[{"type": "parameter", "left": "R2", "operator": "=", "right": "R1*2"},
                {"type": "node", "left": "V(2)", "operator": "<=", "right": 4.1, "x_min": "0", "x_max": null}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].kind, ConstraintKind::Parameter);
        assert_eq!(rows[0].right.as_text(), "R1*2");
        assert_eq!(rows[1].right.as_number(), Some(4.1));
        assert_eq!(rows[1].x_min.as_ref().and_then(Scalar::as_number), Some(0.0));
        assert!(rows[1].x_max.is_none());
    }
}
