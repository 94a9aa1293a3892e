//! Netlist text generation: component value rewriting and analysis
//! statement insertion.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::analysis::AnalysisDirective;
use crate::circuit::{Netlist, ValueOverlay};
use crate::error::{FitError, Result};
use crate::parser::tokenize;

/// Token position of the value field on an R/L/C element line.
const VALUE_TOKEN: usize = 3;

/// Format a component value for the netlist. Mid-range values print as
/// plain decimals, everything else in exponent form.
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e6).contains(&magnitude) {
        format!("{}", value)
    } else {
        format!("{:e}", value)
    }
}

fn is_comment(line: &str) -> bool {
    line.is_empty() || line.starts_with('*') || line.starts_with(';')
}

/// Index of the title line. SPICE always spends the first physical line on it.
fn title_index(lines: &[String]) -> Option<usize> {
    if lines.is_empty() {
        None
    } else {
        Some(0)
    }
}

fn is_continuation(line: &str) -> bool {
    line.trim_start().starts_with('+')
}

/// Replace the value token of a statement spread over its first line and
/// any `+` continuation lines. Returns false when the statement has no value token.
fn replace_value(statement: &mut [String], value: &str) -> bool {
    let mut position = 0;
    for (n, line) in statement.iter_mut().enumerate() {
        let (prefix, body) = if n == 0 {
            ("", line.as_str())
        } else {
            ("+ ", line.trim_start()[1..].trim_start())
        };
        let mut tokens = tokenize(body);
        if position + tokens.len() > VALUE_TOKEN {
            tokens[VALUE_TOKEN - position] = value.to_string();
            let replaced = format!("{}{}", prefix, tokens.join(" "));
            *line = replaced;
            return true;
        }
        position += tokens.len();
    }
    false
}

fn keyword(line: &str) -> String {
    line.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

/// Drop every `.CONTROL` ... `.ENDC` block, both markers included.
pub fn strip_control_blocks(text: &str) -> String {
    let mut kept = Vec::new();
    let mut in_control = false;

    for line in text.lines() {
        match keyword(line).as_str() {
            ".CONTROL" => in_control = true,
            ".ENDC" if in_control => in_control = false,
            _ if !in_control => kept.push(line),
            _ => {}
        }
    }

    join_lines(&kept)
}

fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

/// Writes component values back into netlist text.
///
/// Only the value token of a matching top-level element line is replaced;
/// everything else, including comments and blank lines, passes through.
#[derive(Debug, Default)]
pub struct NetlistWriter;

impl NetlistWriter {
    pub fn new() -> Self {
        NetlistWriter
    }

    /// Replace value tokens of the named components. Keys are upper-case names.
    pub fn rewrite(&self, text: &str, replacements: &HashMap<String, f64>) -> String {
        let stripped = strip_control_blocks(text);
        let lines: Vec<String> = stripped.lines().map(str::to_string).collect();
        let title = title_index(&lines);
        let mut depth = 0usize;
        let mut out = Vec::with_capacity(lines.len());
        let mut idx = 0;

        while idx < lines.len() {
            if Some(idx) == title {
                out.push(lines[idx].clone());
                idx += 1;
                continue;
            }

            let head = keyword(&lines[idx]);
            match head.as_str() {
                ".SUBCKT" => depth += 1,
                ".ENDS" => depth = depth.saturating_sub(1),
                _ => {}
            }

            let mut end = idx + 1;
            while end < lines.len() && is_continuation(&lines[end]) {
                end += 1;
            }
            let mut statement = lines[idx..end].to_vec();

            if depth == 0 && !head.starts_with('.') {
                if let Some(&value) = replacements.get(&head) {
                    if !replace_value(&mut statement, &format_value(value)) {
                        debug!("{} has no value token to rewrite", head);
                    }
                }
            }

            out.extend(statement);
            idx = end;
        }

        join_lines(&out)
    }

    /// Render `text` with the overlay values and any pending `modified`
    /// components of `template`, leaving the template untouched.
    pub fn render(&self, template: &Netlist, text: &str, overlay: &ValueOverlay) -> String {
        let mut replacements: HashMap<String, f64> = template
            .components
            .iter()
            .filter(|comp| comp.modified && comp.is_top_level())
            .map(|comp| (comp.name.to_uppercase(), comp.value))
            .collect();

        for (idx, value) in overlay.iter() {
            if let Some(comp) = template.components.get(idx) {
                replacements.insert(comp.name.to_uppercase(), value);
            }
        }

        self.rewrite(text, &replacements)
    }

    /// Rewrite every `modified` component of `netlist` into `text` and clear the flags.
    pub fn write_modified(&self, netlist: &mut Netlist, text: &str) -> String {
        let replacements: HashMap<String, f64> = netlist
            .components
            .iter()
            .filter(|comp| comp.modified && comp.is_top_level())
            .map(|comp| (comp.name.to_uppercase(), comp.value))
            .collect();
        debug!("Rewriting {} modified component(s)", replacements.len());

        for comp in netlist.components.iter_mut() {
            comp.modified = false;
        }

        self.rewrite(text, &replacements)
    }

    /// Read the netlist's own file, apply pending modifications and write to `dest`.
    pub fn write_modified_file(&self, netlist: &mut Netlist, dest: &Path) -> Result<()> {
        let text = fs::read_to_string(&netlist.path)?;
        let rendered = self.write_modified(netlist, &text);
        write_text(dest, &rendered)
    }
}

/// Write netlist text, mapping failures to [`FitError::NetlistWrite`].
pub fn write_text(dest: &Path, text: &str) -> Result<()> {
    fs::write(dest, text).map_err(|source| FitError::NetlistWrite {
        path: dest.to_path_buf(),
        source,
    })
}

/// Replaces analysis and `.PRINT` statements with exactly one of each.
#[derive(Debug, Default)]
pub struct AnalysisDirectiveWriter;

impl AnalysisDirectiveWriter {
    pub fn new() -> Self {
        AnalysisDirectiveWriter
    }

    /// Target first, then constrained observables, without case-insensitive duplicates
    pub fn print_variables(target: &str, constrained: &[String]) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for var in std::iter::once(target).chain(constrained.iter().map(String::as_str)) {
            let var = var.trim();
            if var.is_empty() {
                continue;
            }
            if !vars.iter().any(|seen| seen.eq_ignore_ascii_case(var)) {
                vars.push(var.to_string());
            }
        }
        vars
    }

    /// Remove existing analysis/print statements and insert the new pair
    pub fn apply(
        &self,
        text: &str,
        directive: &AnalysisDirective,
        print_vars: &[String],
    ) -> Result<String> {
        let statements = self.statements(directive, print_vars)?;
        let mut lines = remove_analysis_statements(text);
        let at = insertion_index(&lines);
        for (offset, statement) in statements.into_iter().enumerate() {
            lines.insert(at + offset, statement);
        }
        Ok(join_lines(&lines))
    }

    fn statements(&self, directive: &AnalysisDirective, print_vars: &[String]) -> Result<Vec<String>> {
        match directive {
            AnalysisDirective::Transient {
                step,
                stop,
                start,
                max_step,
            } => {
                if print_vars.is_empty() {
                    return Err(FitError::InvalidDirective(
                        "transient analysis requires at least one output variable".to_string(),
                    ));
                }
                Ok(vec![
                    format!(
                        ".TRAN {} {} {} {}",
                        format_value(*step),
                        format_value(*stop),
                        format_value(*start),
                        format_value(*max_step)
                    ),
                    format!(".PRINT TRAN {}", print_vars.join(" ")),
                ])
            }
            AnalysisDirective::Ac {
                sweep,
                points,
                start,
                stop,
            } => {
                if print_vars.is_empty() {
                    return Err(FitError::InvalidDirective(
                        "AC analysis requires at least one output variable".to_string(),
                    ));
                }
                Ok(vec![
                    format!(
                        ".AC {} {} {} {}",
                        sweep,
                        points,
                        format_value(*start),
                        format_value(*stop)
                    ),
                    format!(".PRINT AC {}", print_vars.join(" ")),
                ])
            }
            AnalysisDirective::Noise {
                output,
                source,
                sweep,
                points,
                start,
                stop,
            } => {
                if output.trim().is_empty() || source.trim().is_empty() {
                    return Err(FitError::InvalidDirective(
                        "noise analysis requires an output expression and a source".to_string(),
                    ));
                }
                Ok(vec![
                    format!(
                        ".NOISE {} {} {} {} {} {}",
                        output,
                        source,
                        sweep,
                        points,
                        format_value(*start),
                        format_value(*stop)
                    ),
                    ".PRINT NOISE ONOISE INOISE".to_string(),
                ])
            }
        }
    }
}

fn is_analysis_keyword(head: &str) -> bool {
    matches!(head, ".TRAN" | ".AC" | ".NOISE" | ".PRINT")
}

/// Drop analysis and print statements together with their `+` continuations
fn remove_analysis_statements(text: &str) -> Vec<String> {
    let mut kept = Vec::new();
    let mut dropping = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if dropping && trimmed.starts_with('+') {
            continue;
        }
        dropping = is_analysis_keyword(&keyword(line));
        if !dropping {
            kept.push(line.to_string());
        }
    }
    kept
}

fn is_header(head: &str) -> bool {
    matches!(
        head,
        ".TITLE" | ".OPTION" | ".OPTIONS" | ".PARAM" | ".PARAMS" | ".INCLUDE" | ".INC" | ".LIB"
    )
}

/// First top-level line after the title that is not a header directive,
/// comment or blank line. Subcircuit blocks are passed over whole.
fn insertion_index(lines: &[String]) -> usize {
    let start = title_index(lines).map_or(0, |title| title + 1);
    let mut depth = 0usize;

    for (idx, line) in lines.iter().enumerate().skip(start) {
        let trimmed = line.trim();
        let head = keyword(trimmed);
        if head == ".SUBCKT" {
            depth += 1;
            continue;
        }
        if head == ".ENDS" && depth > 0 {
            depth -= 1;
            continue;
        }
        if depth > 0 || is_comment(trimmed) || trimmed.starts_with('+') || is_header(&head) {
            continue;
        }
        return idx;
    }
    lines.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SweepType;
    use crate::parser::SpiceParser;

    const DIVIDER: &str = "Divider\n\
        * supply\n\
        .PARAM rload=2k\n\
        V1 1 0 DC 5\n\
        R1 1 2 1k\n\
        \n\
        R2 2 0 {rload} tc1=0\n\
        .SUBCKT inner a b\n\
        R1 a b 10\n\
        .ENDS inner\n\
        .TRAN 1u 1m\n\
        + 0 1u\n\
        .PRINT TRAN V(1)\n\
        .CONTROL\n\
        run\n\
        .ENDC\n\
        .END\n";

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(4700.0), "4700");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(1e-7), "1e-7");
        assert_eq!(format_value(2.5e6), "2.5e6");
        assert_eq!(format_value(0.001), "0.001");
    }

    #[test]
    fn test_rewrite_touches_only_value_token() {
        let writer = NetlistWriter::new();
        let mut replacements = HashMap::new();
        replacements.insert("R2".to_string(), 3300.0);

        let out = writer.rewrite(DIVIDER, &replacements);
        assert!(out.contains("R2 2 0 3300 tc1=0"));
        assert!(out.contains("R1 1 2 1k"));
        assert!(out.contains("R1 a b 10"));
        assert!(!out.to_uppercase().contains(".CONTROL"));
        assert!(!out.contains("run"));
        assert!(out.contains("\n\n"));
    }

    #[test]
    fn test_write_modified_clears_flags() {
        let writer = NetlistWriter::new();
        let mut netlist = SpiceParser::new().parse_netlist(DIVIDER, "divider.cir");
        netlist.component_mut("R1").unwrap().set_value(1500.0);

        let out = writer.write_modified(&mut netlist, DIVIDER);
        assert!(out.contains("R1 1 2 1500"));
        assert!(netlist.components.iter().all(|c| !c.modified));

        let again = writer.write_modified(&mut netlist, DIVIDER);
        assert!(again.contains("R1 1 2 1k"));
    }

    #[test]
    fn test_unmodified_round_trip_keeps_values() {
        let parser = SpiceParser::new();
        let original = parser.parse_netlist(DIVIDER, "divider.cir");
        let mut working = original.clone();
        let text = NetlistWriter::new().write_modified(&mut working, DIVIDER);
        let reparsed = parser.parse_netlist(&text, "divider.cir");

        assert_eq!(original.components.len(), reparsed.components.len());
        for (a, b) in original.components.iter().zip(&reparsed.components) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.value, b.value);
        }
    }

    #[test]
    fn test_render_leaves_template_untouched() {
        let template = SpiceParser::new().parse_netlist(DIVIDER, "divider.cir");
        let idx = template.component_index("R1").unwrap();
        let mut overlay = ValueOverlay::new();
        overlay.set(idx, 2.2e-7);

        let out = NetlistWriter::new().render(&template, DIVIDER, &overlay);
        assert!(out.contains("R1 1 2 2.2e-7"));
        assert_eq!(template.components[idx].raw_value, "1k");
    }

    #[test]
    fn test_directive_replaces_existing_statements() {
        let writer = AnalysisDirectiveWriter::new();
        let directive = AnalysisDirective::Transient {
            step: 1e-5,
            stop: 1e-3,
            start: 0.0,
            max_step: 1e-5,
        };
        let vars = vec!["V(2)".to_string()];
        let out = writer.apply(DIVIDER, &directive, &vars).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.iter().filter(|l| l.starts_with(".TRAN")).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.starts_with(".PRINT")).count(), 1);
        assert!(!lines.iter().any(|l| l.starts_with("+ 0 1u")));

        let tran = lines.iter().position(|l| l.starts_with(".TRAN")).unwrap();
        let param = lines.iter().position(|l| l.starts_with(".PARAM")).unwrap();
        assert_eq!(tran, param + 1);
        assert_eq!(lines[tran + 1], ".PRINT TRAN V(2)");
    }

    #[test]
    fn test_insertion_passes_over_subcircuit_blocks() {
        let text = "Nested\n.INCLUDE models.lib\n.SUBCKT amp in out\nR1 in out 1k\n.ENDS\nR9 1 0 1k\n";
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(insertion_index(&lines), 5);

        let text = "* C:\\work\\amp.asc\n.INCLUDE models.lib\nR9 1 0 1k\n";
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(insertion_index(&lines), 2);
    }

    #[test]
    fn test_rewrite_first_element_after_comment_title() {
        let text = "* C:\\work\\divider.asc\nR1 1 2 1k\nR2 2 0 1k\nV1 1 0 10\n.END\n";
        let mut replacements = HashMap::new();
        replacements.insert("R1".to_string(), 2000.0);

        let out = NetlistWriter::new().rewrite(text, &replacements);
        assert!(out.starts_with("* C:\\work\\divider.asc\n"));
        assert!(out.contains("R1 1 2 2000\n"));

        let reparsed = SpiceParser::new().parse_netlist(&out, "divider.cir");
        assert_eq!(reparsed.component("R1").map(|c| c.value), Some(2000.0));
    }

    #[test]
    fn test_rewrite_value_on_continuation_line() {
        let text = "split\nV1 1 0 10\nR1 1 2\n+ 1k tc1=0\nR2 2\n+ 0\n+ 2k\nR3 2 0 1k\n.END\n";
        let template = SpiceParser::new().parse_netlist(text, "split.cir");
        let mut overlay = ValueOverlay::new();
        overlay.set(template.component_index("R1").unwrap(), 5000.0);
        overlay.set(template.component_index("R2").unwrap(), 750.0);

        let out = NetlistWriter::new().render(&template, text, &overlay);
        assert!(out.contains("R1 1 2\n+ 5000 tc1=0\n"));
        assert!(out.contains("R2 2\n+ 0\n+ 750\n"));

        let reparsed = SpiceParser::new().parse_netlist(&out, "split.cir");
        assert_eq!(reparsed.component("R1").map(|c| c.value), Some(5000.0));
        assert_eq!(reparsed.component("R2").map(|c| c.value), Some(750.0));
        assert_eq!(reparsed.component("R3").map(|c| c.value), Some(1000.0));
    }

    #[test]
    fn test_ac_and_noise_directives_validate_inputs() {
        let writer = AnalysisDirectiveWriter::new();
        let ac = AnalysisDirective::Ac {
            sweep: SweepType::Dec,
            points: 10,
            start: 10.0,
            stop: 1e5,
        };
        assert!(writer.apply(DIVIDER, &ac, &[]).is_err());
        let out = writer.apply(DIVIDER, &ac, &["VM(2)".to_string()]).unwrap();
        assert!(out.contains(".AC DEC 10 10 1e5"));
        assert!(out.contains(".PRINT AC VM(2)"));

        let noise = AnalysisDirective::Noise {
            output: "V(2)".to_string(),
            source: String::new(),
            sweep: SweepType::Lin,
            points: 5,
            start: 1.0,
            stop: 10.0,
        };
        assert!(matches!(
            writer.apply(DIVIDER, &noise, &[]),
            Err(FitError::InvalidDirective(_))
        ));
    }

    #[test]
    fn test_print_variables_deduplicate() {
        let vars = AnalysisDirectiveWriter::print_variables(
            "V(2)",
            &["v(2)".to_string(), "V(1)".to_string(), " ".to_string()],
        );
        assert_eq!(vars, vec!["V(2)".to_string(), "V(1)".to_string()]);
    }
}
