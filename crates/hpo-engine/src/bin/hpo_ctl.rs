use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hpo_engine::{
    format_jobs, HpoConfig, Orchestrator, PlotDataRenderer, TuningJobs, DEFAULT_STUDY,
};
use hpo_types::parse_param_overrides;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpo-ctl", about = "Control distributed hyperparameter tuning on a PBS cluster")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List your queued and running jobs
    Jobs {
        /// Only jobs with this name
        name: Option<String>,
    },
    /// Start the coordination database job unless it is already running
    RunBackend,
    /// Queue worker jobs that tune one shared study
    RunTuningJobs {
        /// Training data, relative paths are resolved against the current directory
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = 5)]
        n_jobs: usize,
        /// Trials run by each job
        #[arg(long, default_value_t = 10)]
        trials: usize,
        #[arg(long, default_value = DEFAULT_STUDY)]
        study: String,
        #[arg(long, default_value = "CmaEs")]
        sampler: String,
        #[arg(long, default_value = "Median")]
        pruner: String,
        #[arg(long, default_value_t = 100)]
        epochs: u64,
        /// Fixed parameters, e.g. "num_layers=8,lr=0.001"
        #[arg(long, default_value = "")]
        params: String,
    },
    /// Summarize every study in the shared store
    Studies {
        #[arg(long)]
        json: bool,
    },
    /// Delete studies from the shared store
    DeleteStudies {
        #[arg(default_value = DEFAULT_STUDY)]
        names: Vec<String>,
    },
    /// Write plot data for a study under the report directory
    Report {
        #[arg(default_value = DEFAULT_STUDY)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = HpoConfig::from_env().context("reading configuration")?;
    let orchestrator = Orchestrator::new(config);

    match command {
        Commands::Jobs { name } => {
            let jobs = orchestrator.view_jobs(name.as_deref()).await?;
            println!("{}", format_jobs(&jobs, name.as_deref()));
        }
        Commands::RunBackend => {
            let ctx = orchestrator.ensure_backend().await?;
            println!("backend running on {}", ctx.settings().host);
        }
        Commands::RunTuningJobs {
            data,
            n_jobs,
            trials,
            study,
            sampler,
            pruner,
            epochs,
            params,
        } => {
            let jobs = TuningJobs {
                n_jobs,
                trials_per_job: trials,
                study,
                sampler,
                pruner,
                epochs,
                data,
                params: parse_param_overrides(&params)?,
            };
            for ack in orchestrator.run_tuning_jobs(&jobs).await? {
                println!("{ack}");
            }
        }
        Commands::Studies { json } => {
            let summaries = orchestrator.view_studies().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No studies.");
            } else {
                for summary in summaries {
                    println!("{summary}\n");
                }
            }
        }
        Commands::DeleteStudies { names } => {
            orchestrator.delete_studies(&names).await?;
            println!("Deleted {}", names.join(", "));
        }
        Commands::Report { name } => {
            let outcome = orchestrator.generate_report(&name, &PlotDataRenderer).await?;
            for plot in &outcome.plots {
                println!("{}", plot.display());
            }
            match outcome.best {
                Some(best) => println!(
                    "best trial #{}: {}",
                    best.number,
                    best.value.map_or_else(|| "-".to_string(), |v| v.to_string())
                ),
                None => println!("No completed trials."),
            }
        }
    }
    Ok(())
}
