use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use sheratan::config::QueueConfig;
use sheratan::logging;
use sheratan::sim::{self, BenchOptions};

#[derive(Parser)]
#[command(name = "sheratan", about = "Command dispatch queue demo and benchmarks")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo (default)
    Demo,
    /// Run a single benchmark and print one CSV row
    Bench {
        #[arg(long, default_value_t = 4)]
        producers: usize,
        /// Commands submitted by each producer
        #[arg(long, default_value_t = 25)]
        commands: usize,
        #[arg(long, default_value_t = 2)]
        consumers: usize,
        #[command(flatten)]
        options: RunFlags,
    },
    /// Sweep benchmark configurations and print CSV rows
    Stress {
        #[arg(long, value_delimiter = ',', default_values_t = [1usize, 2, 4, 8])]
        producer_sets: Vec<usize>,
        #[arg(long, value_delimiter = ',', default_values_t = [10usize, 25])]
        command_sets: Vec<usize>,
        #[arg(long, value_delimiter = ',', default_values_t = [1usize, 2, 4])]
        consumer_sets: Vec<usize>,
        #[command(flatten)]
        options: RunFlags,
    },
}

#[derive(clap::Args)]
struct RunFlags {
    /// Simulated work per command
    #[arg(long, default_value_t = 5)]
    work_ms: u64,
    /// Consumer backoff when the backlog is empty
    #[arg(long, default_value_t = 1)]
    poll_ms: u64,
    /// Enable extra safety checks
    #[arg(long)]
    validate: bool,
    /// Hold one claim past the stall timeout
    #[arg(long)]
    stall: bool,
}

impl From<RunFlags> for BenchOptions {
    fn from(flags: RunFlags) -> Self {
        BenchOptions {
            work_ms: flags.work_ms,
            poll_ms: flags.poll_ms,
            validate: flags.validate,
            simulate_stall: flags.stall,
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let config = match QueueConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.cmd.unwrap_or(Command::Demo) {
        Command::Demo => sim::run_demo(&config),
        Command::Bench {
            producers,
            commands,
            consumers,
            options,
        } => sim::run_benchmark(producers, commands, consumers, &options.into(), &config),
        Command::Stress {
            producer_sets,
            command_sets,
            consumer_sets,
            options,
        } => sim::run_stress(
            &producer_sets,
            &command_sets,
            &consumer_sets,
            &options.into(),
            &config,
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("run failed: {err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
