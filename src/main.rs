use anyhow::{anyhow, Context};
use colored::*;
use log::{error, info};

use spicefit::cli::{build_command, log_filter, CliArgs, CliCommand, ConsoleSink};
use spicefit::config::JobConfig;
use spicefit::optimizer::OptimizationDriver;
use spicefit::output::OutputFormat;
use spicefit::session::next_session_number;
use spicefit::simulator::ExternalSimulator;
use spicefit::SpiceParser;

use std::path::Path;

fn main() {
    let matches = build_command().get_matches();
    let args = match CliArgs::from_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", format!("Error: {}", e).red());
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(log_filter(args.verbose_level))
        .parse_default_env()
        .init();

    if let Err(e) = run_application(&args) {
        error!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

fn run_application(args: &CliArgs) -> anyhow::Result<()> {
    match &args.command {
        CliCommand::Optimize { job, export, format } => {
            run_optimize(job, export.as_deref(), *format, args.verbose_level)
        }
        CliCommand::Parse { netlist, json } => run_parse(netlist, *json),
        CliCommand::NextSession { runs } => {
            let root = match runs {
                Some(root) => root.clone(),
                None => JobConfig::default().resolved_runs_root(),
            };
            println!("{}", next_session_number(&root));
            Ok(())
        }
    }
}

fn run_optimize(job_path: &Path, export: Option<&Path>, format: OutputFormat, verbose_level: u8) -> anyhow::Result<()> {
    info!("{}", "Starting spicefit optimization".green().bold());
    info!("Job file: {}", job_path.display().to_string().bright_blue());

    let config = JobConfig::load(job_path)
        .with_context(|| format!("Failed to load job file '{}'", job_path.display()))?;
    let job = config
        .to_job()
        .with_context(|| format!("Failed to prepare job from '{}'", job_path.display()))?;

    let simulator = ExternalSimulator::with_config(config.simulator_config());
    if !simulator.is_available() {
        return Err(anyhow!(
            "Simulator '{}' could not be launched; check the `simulator` entry of the job file",
            simulator.config().executable
        ));
    }
    let sink = ConsoleSink {
        show_log: verbose_level > 0,
    };
    let outcome = OptimizationDriver::new(&simulator, &sink).optimize(job);

    if let Some(session) = &outcome.session {
        println!("Session {} written to {}", session.number, session.dir.display().to_string().bright_green());
    }

    if let Some(error) = outcome.error {
        return Err(anyhow!("Optimization failed: {}", error));
    }

    if let Some(path) = export {
        let curve = outcome
            .curve
            .ok_or_else(|| anyhow!("No fitted curve available to export"))?;
        curve
            .export(path, format)
            .with_context(|| format!("Failed to export fitted curve to '{}'", path.display()))?;
        info!("Fitted curve exported to: {}", path.display().to_string().bright_green());
    }

    Ok(())
}

fn run_parse(path: &Path, json: bool) -> anyhow::Result<()> {
    if !path.exists() {
        return Err(anyhow!("Netlist file '{}' not found", path.display()));
    }

    let netlist = SpiceParser::new().parse_file(path);
    if netlist.is_empty() {
        return Err(anyhow!("No components or nodes found in '{}'", path.display()));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&netlist)?);
    } else {
        netlist.print_summary();
    }
    Ok(())
}
