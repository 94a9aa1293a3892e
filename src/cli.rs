use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use log::LevelFilter;

use crate::events::{Event, EventSink};
use crate::output::OutputFormat;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: CliCommand,
    pub verbose_level: u8,
}

#[derive(Debug, Clone)]
pub enum CliCommand {
    Optimize {
        job: PathBuf,
        export: Option<PathBuf>,
        format: OutputFormat,
    },
    Parse {
        netlist: PathBuf,
        json: bool,
    },
    NextSession {
        runs: Option<PathBuf>,
    },
}

pub fn build_command() -> Command {
    Command::new("spicefit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fit SPICE component values to a target response using an external simulator")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase verbosity level"),
        )
        .subcommand(
            Command::new("optimize")
                .about("Run one optimization session from a JSON job file")
                .arg(Arg::new("job").help("Job description (.json)").required(true).index(1))
                .arg(
                    Arg::new("export")
                        .short('o')
                        .long("export")
                        .value_name("FILE")
                        .help("Write the fitted curve to FILE"),
                )
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .default_value("csv")
                        .value_parser(["csv", "json"])
                        .help("Export format"),
                ),
        )
        .subcommand(
            Command::new("parse")
                .about("Parse a netlist and print its components and nodes")
                .arg(Arg::new("netlist").help("SPICE netlist").required(true).index(1))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the parsed netlist as JSON"),
                ),
        )
        .subcommand(
            Command::new("next-session")
                .about("Print the number the next optimization session will get")
                .arg(
                    Arg::new("runs")
                        .long("runs")
                        .value_name("DIR")
                        .help("Runs directory (default: runs, or $SPICEFIT_WORKSPACE/runs)"),
                ),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let verbose_level = matches.get_count("verbose");

        let command = match matches.subcommand() {
            Some(("optimize", sub)) => {
                let job = sub
                    .get_one::<String>("job")
                    .ok_or_else(|| anyhow!("Job file is required"))?;
                let format = match sub.get_one::<String>("format").map(String::as_str) {
                    Some("json") => OutputFormat::Json,
                    Some("csv") | None => OutputFormat::Csv,
                    Some(other) => return Err(anyhow!("Invalid output format '{}'", other)),
                };
                CliCommand::Optimize {
                    job: PathBuf::from(job),
                    export: sub.get_one::<String>("export").map(PathBuf::from),
                    format,
                }
            }
            Some(("parse", sub)) => {
                let netlist = sub
                    .get_one::<String>("netlist")
                    .ok_or_else(|| anyhow!("Netlist file is required"))?;
                CliCommand::Parse {
                    netlist: PathBuf::from(netlist),
                    json: sub.get_flag("json"),
                }
            }
            Some(("next-session", sub)) => CliCommand::NextSession {
                runs: sub.get_one::<String>("runs").map(PathBuf::from),
            },
            _ => return Err(anyhow!("No command given")),
        };

        Ok(CliArgs {
            command,
            verbose_level,
        })
    }
}

/// Log filter for `-v` occurrences: warn, info, debug, then trace
pub fn log_filter(verbose_level: u8) -> LevelFilter {
    match verbose_level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Prints observer events to the terminal
#[derive(Debug, Default)]
pub struct ConsoleSink {
    /// Also print every `Log` event, not just progress.
    pub show_log: bool,
}

impl EventSink for ConsoleSink {
    fn send(&self, event: Event) {
        match event {
            Event::Log(message) => {
                if self.show_log {
                    println!("{} {}", "[log]".dimmed(), message);
                }
            }
            Event::Update(message) => println!("{} {}", "[update]".cyan(), message),
            Event::UpdateYData { x, .. } => {
                if self.show_log {
                    println!("{} {} points", "[curve]".dimmed(), x.len());
                }
            }
            Event::UpdateNetlist(netlist) => {
                for component in netlist.components.iter().filter(|c| c.variable || c.modified) {
                    println!("{} {} = {}", "[value]".bright_blue(), component.name, component.value);
                }
            }
            Event::UpdateOptimizationResults(result) => println!(
                "{} runs={} iterations={} cost {:e} -> {:e} optimality={:e}",
                "[result]".green(),
                result.simulator_runs,
                result.iterations,
                result.initial_cost,
                result.final_cost,
                result.optimality
            ),
            Event::Done => println!("{}", "Optimization completed successfully!".green().bold()),
            Event::Failed(message) => println!("{} {}", "[failed]".red().bold(), message),
        }
    }
}
