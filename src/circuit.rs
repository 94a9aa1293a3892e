use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Scope name used for statements outside any `.SUBCKT` block.
pub const TOP_SCOPE: &str = "top";

/// Element class, keyed by the leading letter of an element statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementClass {
    CodeModel,
    Behavioral,
    Capacitor,
    Diode,
    Vcvs,
    Cccs,
    Vccs,
    Ccvs,
    CurrentSource,
    Jfet,
    Inductor,
    Mosfet,
    LossyLine,
    Bjt,
    Resistor,
    Switch,
    TransmissionLine,
    UniformRc,
    VoltageSource,
    CurrentSwitch,
    Subcircuit,
    Mesfet,
}

/// How the node terminals of an element statement are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminals {
    /// Tokens `1..=n` are nodes.
    Fixed(usize),
    /// Every token between the name and the trailing subcircuit name.
    AllButLast,
}

impl ElementClass {
    pub fn from_letter(letter: char) -> Option<Self> {
        let class = match letter.to_ascii_uppercase() {
            'A' => ElementClass::CodeModel,
            'B' => ElementClass::Behavioral,
            'C' => ElementClass::Capacitor,
            'D' => ElementClass::Diode,
            'E' => ElementClass::Vcvs,
            'F' => ElementClass::Cccs,
            'G' => ElementClass::Vccs,
            'H' => ElementClass::Ccvs,
            'I' => ElementClass::CurrentSource,
            'J' => ElementClass::Jfet,
            'L' => ElementClass::Inductor,
            'M' => ElementClass::Mosfet,
            'O' => ElementClass::LossyLine,
            'Q' => ElementClass::Bjt,
            'R' => ElementClass::Resistor,
            'S' => ElementClass::Switch,
            'T' => ElementClass::TransmissionLine,
            'U' => ElementClass::UniformRc,
            'V' => ElementClass::VoltageSource,
            'W' => ElementClass::CurrentSwitch,
            'X' => ElementClass::Subcircuit,
            'Z' => ElementClass::Mesfet,
            _ => return None,
        };
        Some(class)
    }

    pub fn letter(&self) -> char {
        match self {
            ElementClass::CodeModel => 'A',
            ElementClass::Behavioral => 'B',
            ElementClass::Capacitor => 'C',
            ElementClass::Diode => 'D',
            ElementClass::Vcvs => 'E',
            ElementClass::Cccs => 'F',
            ElementClass::Vccs => 'G',
            ElementClass::Ccvs => 'H',
            ElementClass::CurrentSource => 'I',
            ElementClass::Jfet => 'J',
            ElementClass::Inductor => 'L',
            ElementClass::Mosfet => 'M',
            ElementClass::LossyLine => 'O',
            ElementClass::Bjt => 'Q',
            ElementClass::Resistor => 'R',
            ElementClass::Switch => 'S',
            ElementClass::TransmissionLine => 'T',
            ElementClass::UniformRc => 'U',
            ElementClass::VoltageSource => 'V',
            ElementClass::CurrentSwitch => 'W',
            ElementClass::Subcircuit => 'X',
            ElementClass::Mesfet => 'Z',
        }
    }

    /// Get the terminal layout for this element class
    pub fn terminals(&self) -> Terminals {
        match self {
            ElementClass::Behavioral
            | ElementClass::Capacitor
            | ElementClass::Diode
            | ElementClass::Cccs
            | ElementClass::Ccvs
            | ElementClass::CurrentSource
            | ElementClass::Inductor
            | ElementClass::Resistor
            | ElementClass::VoltageSource
            | ElementClass::CurrentSwitch => Terminals::Fixed(2),
            ElementClass::Jfet
            | ElementClass::Bjt
            | ElementClass::UniformRc
            | ElementClass::Mesfet => Terminals::Fixed(3),
            ElementClass::Vcvs
            | ElementClass::Vccs
            | ElementClass::Mosfet
            | ElementClass::LossyLine
            | ElementClass::Switch
            | ElementClass::TransmissionLine => Terminals::Fixed(4),
            ElementClass::CodeModel => Terminals::Fixed(8),
            ElementClass::Subcircuit => Terminals::AllButLast,
        }
    }

    /// Returns true for the passive classes whose value the optimizer can tune
    pub fn is_tunable(&self) -> bool {
        matches!(
            self,
            ElementClass::Resistor | ElementClass::Capacitor | ElementClass::Inductor
        )
    }
}

/// One circuit element with a numeric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub class: ElementClass,
    pub value: f64,
    /// Literal as written in the netlist, before unit resolution.
    pub raw_value: String,
    pub variable: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub modified: bool,
    pub model: Option<String>,
    pub scope: String,
    pub metadata: BTreeMap<String, String>,
}

impl Component {
    pub fn new(name: impl Into<String>, class: ElementClass, value: f64, raw_value: impl Into<String>) -> Self {
        Component {
            name: name.into(),
            class,
            value,
            raw_value: raw_value.into(),
            variable: false,
            min_value: None,
            max_value: None,
            modified: false,
            model: None,
            scope: TOP_SCOPE.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.scope == TOP_SCOPE
    }

    /// Set a new value and flag the component for rewriting
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        self.modified = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludeKind {
    Include,
    Lib,
}

/// A `.INCLUDE`, `.INC` or `.LIB` statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeDirective {
    pub kind: IncludeKind,
    pub path: String,
    /// Library section name, `.LIB` only.
    pub section: Option<String>,
    pub raw: String,
    pub scope: String,
}

/// Outcome of looking an include path up on disk
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInclude {
    pub directive: IncludeDirective,
    pub resolved_path: Option<PathBuf>,
}

impl ResolvedInclude {
    pub fn found(&self) -> bool {
        self.resolved_path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub kind: String,
    pub definition: String,
    pub scope: String,
}

/// Parsed netlist: top-level components and nodes plus the directives
/// needed to rewrite and simulate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Netlist {
    pub title: String,
    pub path: PathBuf,
    /// Top-level components in file order.
    pub components: Vec<Component>,
    /// Top-level node names in file order, without duplicates.
    pub nodes: Vec<String>,
    pub includes: Vec<IncludeDirective>,
    /// Keyed by upper-cased model name.
    pub models: BTreeMap<String, ModelDefinition>,
    /// Keyed by upper-cased parameter name.
    pub parameters: HashMap<String, f64>,
}

impl Netlist {
    /// An empty model bound to `path`, used when the file cannot be read.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Netlist {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.nodes.is_empty()
    }

    /// Find a component index by name (case-insensitive)
    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components
            .iter()
            .position(|comp| comp.name.eq_ignore_ascii_case(name))
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.component_index(name).map(|idx| &self.components[idx])
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        match self.component_index(name) {
            Some(idx) => self.components.get_mut(idx),
            None => None,
        }
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|node| node == name)
    }

    /// Indices of the components the optimizer is allowed to move
    pub fn variable_indices(&self) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, comp)| comp.variable && comp.is_top_level())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Current component values with `overlay` applied on top
    pub fn values_with(&self, overlay: &ValueOverlay) -> Vec<f64> {
        self.components
            .iter()
            .enumerate()
            .map(|(idx, comp)| overlay.get(idx).unwrap_or(comp.value))
            .collect()
    }

    /// Resolve include paths against the netlist directory, then each search path in order.
    pub fn resolve_include_paths(&self, search_paths: &[PathBuf]) -> Vec<ResolvedInclude> {
        let netlist_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        self.includes
            .iter()
            .map(|directive| {
                let resolved_path = if directive.path.is_empty() {
                    None
                } else {
                    let token = Path::new(&directive.path);
                    let candidates: Vec<PathBuf> = if token.is_absolute() {
                        vec![token.to_path_buf()]
                    } else {
                        std::iter::once(netlist_dir.join(token))
                            .chain(search_paths.iter().map(|base| base.join(token)))
                            .collect()
                    };
                    candidates.into_iter().find(|candidate| candidate.exists())
                };
                ResolvedInclude {
                    directive: directive.clone(),
                    resolved_path,
                }
            })
            .collect()
    }

    /// Print netlist summary
    pub fn print_summary(&self) {
        println!("Netlist: {}", self.title);
        println!("File: {}", self.path.display());
        println!("Nodes: {}", self.nodes.len());
        println!("Components: {}", self.components.len());

        let mut class_counts: BTreeMap<char, usize> = BTreeMap::new();
        for component in &self.components {
            *class_counts.entry(component.class.letter()).or_insert(0) += 1;
        }
        for (letter, count) in class_counts {
            println!("  {}: {}", letter, count);
        }

        for component in &self.components {
            println!("  {} = {} ({})", component.name, component.value, component.raw_value);
        }
        if !self.includes.is_empty() {
            println!("Includes: {}", self.includes.len());
        }
        if !self.models.is_empty() {
            println!("Models: {}", self.models.len());
        }
    }
}

/// Per-evaluation component values keyed by component index.
///
/// The template netlist is never mutated while a solve runs; each
/// evaluation builds an overlay and renders the working copy from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueOverlay {
    values: BTreeMap<usize, f64>,
}

impl ValueOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize, value: f64) {
        self.values.insert(index, value);
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(&index).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values.iter().map(|(&idx, &value)| (idx, value))
    }
}
