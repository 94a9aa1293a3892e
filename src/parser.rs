use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, error};
use regex::Regex;

use crate::circuit::{
    Component, ElementClass, IncludeDirective, IncludeKind, ModelDefinition, Netlist, Terminals,
    TOP_SCOPE,
};

lazy_static! {
    static ref VALUE_PATTERN: Regex = Regex::new(
        r"^([+-]?\d*\.?\d+(?:[eE][+-]?\d+)?)([A-Za-z]+)?$"
    ).unwrap();

    static ref ASSIGNMENT_SPACING: Regex = Regex::new(r"\s*=\s*").unwrap();
}

/// Netlist reader: text in, [`Netlist`] out.
///
/// Statements inside `.SUBCKT` ... `.ENDS` only contribute parameters,
/// models and includes; their elements and nodes stay out of the
/// top-level collections.
#[derive(Debug, Default)]
pub struct SpiceParser;

impl SpiceParser {
    pub fn new() -> Self {
        SpiceParser
    }

    /// Parse a netlist file. Read failures are logged and produce an empty model.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Netlist {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => self.parse_netlist(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("The file '{}' was not found", path.display());
                Netlist::empty(path)
            }
            Err(e) => {
                error!("Failed to read netlist '{}': {}", path.display(), e);
                Netlist::empty(path)
            }
        }
    }

    pub fn parse_netlist(&self, content: &str, path: impl AsRef<Path>) -> Netlist {
        let mut state = ParseState::default();

        // The first physical line is the title, whatever it holds
        let (title, body) = content.split_once('\n').unwrap_or((content, ""));

        for line in self.preprocess_lines(body) {
            state.process_statement(&line);
        }

        let netlist = state.finish(title.trim().to_string(), path.as_ref());
        debug!(
            "Parsed '{}': {} components, {} nodes, {} parameters",
            netlist.path.display(),
            netlist.components.len(),
            netlist.nodes.len(),
            netlist.parameters.len()
        );
        netlist
    }

    /// Preprocess SPICE netlist lines - join `+` continuations into logical statements
    pub fn preprocess_lines(&self, content: &str) -> Vec<String> {
        let mut processed_lines = Vec::new();
        let mut current_line = String::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('*') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('+') {
                if !current_line.is_empty() {
                    current_line.push(' ');
                    current_line.push_str(rest.trim());
                    continue;
                }
            }

            if !current_line.is_empty() {
                processed_lines.push(std::mem::take(&mut current_line));
            }
            current_line = line.to_string();
        }

        if !current_line.is_empty() {
            processed_lines.push(current_line);
        }

        processed_lines
    }
}

#[derive(Default)]
struct ParseState {
    components: Vec<Component>,
    nodes: Vec<String>,
    seen_nodes: HashSet<String>,
    includes: Vec<IncludeDirective>,
    models: BTreeMap<String, ModelDefinition>,
    parameters: HashMap<String, f64>,
    subckt_stack: Vec<String>,
    /// Bare tokens after a component value, matched against models once all are known.
    model_candidates: Vec<(usize, String)>,
}

impl ParseState {
    fn scope(&self) -> String {
        self.subckt_stack
            .last()
            .cloned()
            .unwrap_or_else(|| TOP_SCOPE.to_string())
    }

    fn add_node(&mut self, name: &str) {
        if self.seen_nodes.insert(name.to_string()) {
            self.nodes.push(name.to_string());
        }
    }

    fn process_statement(&mut self, statement: &str) {
        let tokens = tokenize(statement);
        let Some(first) = tokens.first() else {
            return;
        };

        let keyword = first.to_uppercase();
        let scope = self.scope();

        match keyword.as_str() {
            ".SUBCKT" => {
                self.subckt_stack
                    .push(tokens.get(1).cloned().unwrap_or_default());
                return;
            }
            ".ENDS" => {
                self.subckt_stack.pop();
                return;
            }
            ".INCLUDE" | ".INC" => {
                self.includes.push(IncludeDirective {
                    kind: IncludeKind::Include,
                    path: tokens.get(1).map(|t| unquote(t)).unwrap_or_default(),
                    section: None,
                    raw: statement.to_string(),
                    scope,
                });
                return;
            }
            ".LIB" => {
                self.includes.push(IncludeDirective {
                    kind: IncludeKind::Lib,
                    path: tokens.get(1).map(|t| unquote(t)).unwrap_or_default(),
                    section: tokens.get(2).cloned(),
                    raw: statement.to_string(),
                    scope,
                });
                return;
            }
            ".MODEL" => {
                if tokens.len() >= 3 {
                    self.models.insert(
                        tokens[1].to_uppercase(),
                        ModelDefinition {
                            kind: tokens[2].clone(),
                            definition: statement.to_string(),
                            scope,
                        },
                    );
                }
                return;
            }
            ".PARAM" | ".PARAMS" => {
                let body = statement[first.len()..].trim();
                for (key, expr) in param_assignments(body) {
                    match convert_value(&expr, &self.parameters) {
                        Some(value) => {
                            self.parameters.insert(key.to_uppercase(), value);
                        }
                        None => debug!("Parameter {} = '{}' has no numeric value", key, expr),
                    }
                }
                return;
            }
            _ => {}
        }

        if scope != TOP_SCOPE {
            return;
        }

        let Some(class) = first.chars().next().and_then(ElementClass::from_letter) else {
            return;
        };

        match class.terminals() {
            Terminals::AllButLast => {
                if tokens.len() > 2 {
                    for token in &tokens[1..tokens.len() - 1] {
                        self.add_node(token);
                    }
                }
            }
            Terminals::Fixed(count) => {
                if tokens.len() <= count {
                    return;
                }
                if class.is_tunable() && tokens.len() >= 4 {
                    self.add_component(class, &tokens);
                }
                for token in &tokens[1..=count] {
                    self.add_node(token);
                }
            }
        }
    }

    fn add_component(&mut self, class: ElementClass, tokens: &[String]) {
        let raw_value = &tokens[3];
        let Some(value) = convert_value(raw_value, &self.parameters) else {
            debug!("Skipping {}: value '{}' is not numeric", tokens[0], raw_value);
            return;
        };

        let mut component = Component::new(tokens[0].clone(), class, value, raw_value.clone());
        let index = self.components.len();
        for token in &tokens[4..] {
            match token.split_once('=') {
                Some((key, val)) => {
                    component
                        .metadata
                        .insert(key.trim().to_uppercase(), val.trim().to_string());
                }
                None => self.model_candidates.push((index, token.clone())),
            }
        }
        self.components.push(component);
    }

    fn finish(mut self, title: String, path: &Path) -> Netlist {
        for (index, token) in std::mem::take(&mut self.model_candidates) {
            let component = &mut self.components[index];
            if component.model.is_none() && self.models.contains_key(&token.to_uppercase()) {
                component.model = Some(token);
            }
        }

        Netlist {
            title,
            path: path.to_path_buf(),
            components: self.components,
            nodes: self.nodes,
            includes: self.includes,
            models: self.models,
            parameters: self.parameters,
        }
    }
}

/// Split a statement on whitespace, keeping quoted strings and `{...}` groups whole
pub fn tokenize(statement: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut brace_depth = 0usize;

    for c in statement.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '{' => {
                    brace_depth += 1;
                    current.push(c);
                }
                '}' => {
                    brace_depth = brace_depth.saturating_sub(1);
                    current.push(c);
                }
                c if c.is_whitespace() && brace_depth == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(token: &str) -> String {
    token.trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Split a `.PARAM` body into `(name, expression)` pairs
fn param_assignments(body: &str) -> Vec<(String, String)> {
    let cleaned = ASSIGNMENT_SPACING.replace_all(body, "=");
    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut depth = 0usize;

    for c in cleaned.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 && (c == ',' || c.is_whitespace()) {
            if !buffer.trim().is_empty() {
                segments.push(buffer.trim().to_string());
            }
            buffer.clear();
            continue;
        }
        buffer.push(c);
    }
    if !buffer.trim().is_empty() {
        segments.push(buffer.trim().to_string());
    }

    segments
        .into_iter()
        .filter_map(|segment| {
            let (key, expr) = segment.split_once('=')?;
            let (key, expr) = (key.trim(), expr.trim());
            if key.is_empty() || expr.is_empty() {
                None
            } else {
                Some((key.to_string(), expr.to_string()))
            }
        })
        .collect()
}

/// Resolve a value literal to a number.
///
/// Order: strip `VALUE=`, strip enclosing braces, look the literal up as a
/// parameter, parse as a plain float, then as `<number><suffix>`. Anything
/// else has no value.
pub fn convert_value(literal: &str, parameters: &HashMap<String, f64>) -> Option<f64> {
    let mut cleaned = literal.trim().replace(['\u{00b5}', '\u{03bc}'], "u");
    if cleaned.is_empty() {
        return None;
    }

    if cleaned
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("VALUE="))
    {
        cleaned = cleaned[6..].trim().to_string();
    }
    if cleaned.starts_with('{') && cleaned.ends_with('}') && cleaned.len() >= 2 {
        let inner = cleaned[1..cleaned.len() - 1].trim();
        if inner.is_empty() {
            return None;
        }
        cleaned = inner.to_string();
    }

    if let Some(&value) = parameters.get(&cleaned.to_uppercase()) {
        return Some(value);
    }

    parse_value_with_unit(&cleaned)
}

/// Parse value with unit suffix (e.g., 4.7k, 1Meg, 100n, 2.2u)
pub fn parse_value_with_unit(value_str: &str) -> Option<f64> {
    let value_str = value_str.trim();
    if let Ok(value) = value_str.parse::<f64>() {
        return Some(value);
    }

    let captures = VALUE_PATTERN.captures(value_str)?;
    let base = captures.get(1)?.as_str().parse::<f64>().ok()?;
    let suffix = captures.get(2).map(|m| m.as_str()).unwrap_or("");
    suffix_multiplier(suffix).map(|multiplier| base * multiplier)
}

/// Multiplier for an SI suffix. Case-sensitive single letters win over the
/// case-insensitive table.
pub fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return Some(1.0);
    }

    match suffix {
        "M" => return Some(1e6),
        "m" => return Some(1e-3),
        "P" => return Some(1e15),
        "Z" => return Some(1e21),
        "Y" => return Some(1e24),
        _ => {}
    }

    let multiplier = match suffix.to_lowercase().as_str() {
        "mil" => 25.4e-6,
        "y" => 1e-24,
        "z" => 1e-21,
        "a" => 1e-18,
        "f" => 1e-15,
        "p" => 1e-12,
        "n" => 1e-9,
        "u" => 1e-6,
        "k" => 1e3,
        "meg" => 1e6,
        "g" => 1e9,
        "t" => 1e12,
        "e" => 1e18,
        _ => return None,
    };
    Some(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * b.abs().max(1.0)
    }

    #[test]
    fn test_parse_value_with_unit() {
        assert!(approx(parse_value_with_unit("4.7k").unwrap(), 4700.0));
        assert!(approx(parse_value_with_unit("100n").unwrap(), 1e-7));
        assert!(approx(parse_value_with_unit("1Meg").unwrap(), 1e6));
        assert!(approx(parse_value_with_unit("2.2u").unwrap(), 2.2e-6));
        assert!(approx(parse_value_with_unit("10m").unwrap(), 10e-3));
        assert!(approx(parse_value_with_unit("1M").unwrap(), 1e6));
        assert!(approx(parse_value_with_unit("3mil").unwrap(), 76.2e-6));
        assert_eq!(parse_value_with_unit("1e3").unwrap(), 1000.0);
    }

    #[test]
    fn test_unknown_suffix_has_no_value() {
        assert_eq!(parse_value_with_unit("5q"), None);
        assert_eq!(parse_value_with_unit("1kohm"), None);
        assert_eq!(parse_value_with_unit("abc"), None);
    }

    #[test]
    fn test_convert_value_resolution_order() {
        let mut params = HashMap::new();
        params.insert("RLOAD".to_string(), 470.0);

        assert_eq!(convert_value("{rload}", &params), Some(470.0));
        assert_eq!(convert_value("VALUE={RLOAD}", &params), Some(470.0));
        assert_eq!(convert_value("value=2k", &params), Some(2000.0));
        assert!(approx(convert_value("4.7\u{00b5}", &params).unwrap(), 4.7e-6));
        assert_eq!(convert_value("{}", &params), None);
        assert_eq!(convert_value("{RMISSING}", &params), None);
    }

    #[test]
    fn test_preprocess_joins_continuations() {
        let parser = SpiceParser::new();
        let lines = parser.preprocess_lines("Title\n* comment\nR1 1 2\n+ 1k\n\n.end\n");
        assert_eq!(lines, vec!["Title", "R1 1 2 1k", ".end"]);
    }

    #[test]
    fn test_tokenize_keeps_quotes_and_braces() {
        assert_eq!(
            tokenize(r#".INCLUDE "my models.lib""#),
            vec![".INCLUDE", r#""my models.lib""#]
        );
        assert_eq!(tokenize("R1 a b {R0 * 2}"), vec!["R1", "a", "b", "{R0 * 2}"]);
    }

    #[test]
    fn test_param_assignments() {
        let pairs = param_assignments("A = 1k, B=2  C={A*2}");
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1k".to_string()),
                ("B".to_string(), "2".to_string()),
                ("C".to_string(), "{A*2}".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_divider() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist(
            "Voltage Divider\n.PARAM rtop=1k\nV1 1 0 DC 5\nR1 1 2 {rtop}\nR2 2 0 2k\n.TRAN 1u 1m\n.end\n",
            "divider.cir",
        );

        assert_eq!(netlist.title, "Voltage Divider");
        assert_eq!(netlist.components.len(), 2);
        assert_eq!(netlist.components[0].name, "R1");
        assert_eq!(netlist.components[0].value, 1000.0);
        assert_eq!(netlist.components[0].raw_value, "{rtop}");
        assert_eq!(netlist.components[1].value, 2000.0);
        assert_eq!(netlist.nodes, vec!["1", "0", "2"]);
        assert_eq!(netlist.parameters.get("RTOP"), Some(&1000.0));
    }

    #[test]
    fn test_comment_title_keeps_first_element() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist(
            "* C:\\work\\divider.asc\nR1 1 2 1k\n+ TC1=0\nR2 2 0 1k\nV1 1 0 10\n.END\n",
            "divider.cir",
        );

        assert_eq!(netlist.title, "* C:\\work\\divider.asc");
        let names: Vec<_> = netlist.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["R1", "R2"]);
        assert_eq!(netlist.components[0].metadata["TC1"], "0");
        assert_eq!(netlist.nodes, vec!["1", "2", "0"]);
    }

    #[test]
    fn test_subcircuit_contents_are_scoped_out() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist(
            "Sub test\n.SUBCKT amp in out\nRINT in mid 10k\nCINT mid out 1n\n.ENDS\nX1 a b amp\nR1 a 0 1k\n",
            "sub.cir",
        );

        let names: Vec<_> = netlist.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["R1"]);
        assert!(!netlist.has_node("mid"));
        assert!(!netlist.has_node("in"));
        assert!(netlist.has_node("a"));
        assert!(netlist.has_node("b"));
        assert!(!netlist.has_node("amp"));
    }

    #[test]
    fn test_terminal_extraction_by_class() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist(
            "Terminals\nQ1 c b e qmod\nM1 d g s bulk nmos\nE1 o1 o2 i1 i2 10\nD1 an ca dmod\n",
            "t.cir",
        );
        assert_eq!(
            netlist.nodes,
            vec!["c", "b", "e", "d", "g", "s", "bulk", "o1", "o2", "i1", "i2", "an", "ca"]
        );
        assert!(netlist.components.is_empty());
    }

    #[test]
    fn test_directives_and_models() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist(
            "Dirs\n.INCLUDE \"parts.lib\"\n.LIB models.lib TT\n.MODEL RMOD R TC1=0.01\nR1 1 0 1k RMOD TC1=0.002\n",
            "d.cir",
        );

        assert_eq!(netlist.includes.len(), 2);
        assert_eq!(netlist.includes[0].path, "parts.lib");
        assert_eq!(netlist.includes[1].kind, IncludeKind::Lib);
        assert_eq!(netlist.includes[1].section.as_deref(), Some("TT"));
        assert_eq!(netlist.models["RMOD"].kind, "R");
        assert_eq!(netlist.components[0].model.as_deref(), Some("RMOD"));
        assert_eq!(netlist.components[0].metadata["TC1"], "0.002");
    }

    #[test]
    fn test_unresolvable_value_is_skipped() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_netlist("Lossy\nR1 1 2 5q\nR2 2 0 1k\n", "l.cir");
        assert_eq!(netlist.components.len(), 1);
        assert_eq!(netlist.components[0].name, "R2");
        assert!(netlist.has_node("1"));
    }

    #[test]
    fn test_missing_file_yields_empty_model() {
        let parser = SpiceParser::new();
        let netlist = parser.parse_file("/definitely/not/here.cir");
        assert!(netlist.is_empty());
        assert_eq!(netlist.path, Path::new("/definitely/not/here.cir"));
    }
}
