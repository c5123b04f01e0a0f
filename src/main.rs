use clap::{ArgAction, Parser};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::process::ExitCode;
use tracksniff::analyser;
use tracksniff::config::Config;
use tracksniff::ui::output;

/// tracksniff reconstructs and labels web resources from crawler captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = "tracksniff.toml", value_parser)]
    config: PathBuf,

    /// Corpus root, overrides output.data_path
    #[arg(short = 'd', long, value_parser)]
    data_path: Option<PathBuf>,

    /// Only process this visit folder (raw/<website>/<visit>)
    #[arg(short = 'v', long, value_parser)]
    visit: Option<PathBuf>,

    /// Number of worker threads, defaults to one per core
    #[arg(short = 'j', long, value_parser)]
    jobs: Option<usize>,

    /// Skip writing the aggregated resource table
    #[arg(long, action = ArgAction::SetTrue)]
    no_table: bool,

    /// Display the summary as formatted JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Cannot read config {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(data_path) = args.data_path {
        config.output.data_path = data_path;
    }

    if let Err(err) = SimpleLogger::new().with_level(config.log_level()).env().init() {
        eprintln!("Cannot set up logging: {err}");
    }
    if !args.config.is_file() {
        log::warn!("No config file at {}, running with defaults.", args.config.display());
    }
    log::debug!("Configuration used {config:?}");

    match run(&args.visit, args.jobs, !args.no_table, args.json, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(visit: &Option<PathBuf>, jobs: Option<usize>, table: bool, json: bool, config: &Config) -> tracksniff::Result<()> {
    let studies = analyser::core::select_studies(config, visit.as_deref())?;
    if studies.is_empty() {
        log::warn!("No study folders found.");
        return Ok(());
    }

    let outcomes = analyser::core::analyse(config, &studies, jobs)?;

    if table {
        analyser::core::write_table(&outcomes, config)?;
    }

    // ---- Output ----
    let summaries = output::summarize(&outcomes);
    if json {
        println!("{}", output::data_as_json(&summaries)?);
    } else {
        output::print_results(&summaries);
    }

    log::info!("Finished {} studies", outcomes.len());
    Ok(())
}
