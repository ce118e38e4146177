use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use log::{error, info, LevelFilter};

use infuse::{load_case, InfuseError};

#[derive(Parser)]
#[command(name = "infuse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resin infusion filling simulation", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version banner
    Info,
    /// Fill the part described by a case file and save the results
    Run {
        /// Path to the case json
        case: PathBuf,
    },
}

fn banner() -> String {
    let authors = env!("CARGO_PKG_AUTHORS");
    format!(
        "infuse {}\n{}\nauthors: {}\nlicense: {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_DESCRIPTION"),
        if authors.is_empty() { "unknown" } else { authors },
        env!("CARGO_PKG_LICENSE"),
    )
}

fn run(case_path: &Path) -> Result<(), InfuseError> {
    let mut case = load_case(case_path)?;
    case.model.print_mesh_info()?;
    case.model.print_simulation_parameters();
    case.model.solve()?;
    case.model.print_sensor_readings();

    let solution = case
        .model
        .latest_solution()
        .ok_or_else(|| InfuseError::State("solve produced no solution".into()))?;
    let dir = case
        .model
        .save_results(solution, &case.result_name, &case.output)?;
    info!("results written to {}", dir.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    match cli.command {
        Some(Commands::Info) => {
            println!("{}", banner());
            ExitCode::SUCCESS
        }
        Some(Commands::Run { case }) => match run(&case) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        },
        None => {
            let _ = Cli::command().print_help();
            ExitCode::SUCCESS
        }
    }
}
