use clap::{Parser, Subcommand};
use cohesim::{config, sim};
use color_eyre::eyre::{self, WrapErr};
use console::style;
use std::path::PathBuf;

#[derive(Debug, clap::Args)]
struct Run {
    /// Cache configuration (YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override the protocol of the configuration, e.g. "InclusiveMOESI:snoop_lru=true"
    #[arg(short, long)]
    protocol: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    cycles: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Traffic settings (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    traffic: Option<PathBuf>,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Write a checkpoint of the cache contents after the run
    #[arg(long, value_name = "FILE")]
    save_state: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive one cache controller with synthetic traffic
    Run(Run),
    /// Print the default configuration
    DefaultConfig,
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    #[command(subcommand)]
    command: Command,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

fn run(options: &Run) -> eyre::Result<()> {
    let mut config = config::Cache::from_file(&options.config)
        .wrap_err_with(|| format!("failed to load {}", options.config.display()))?;
    if let Some(protocol) = &options.protocol {
        config.protocol = protocol.clone();
        config.validate()?;
    }
    let traffic = match &options.traffic {
        Some(path) => sim::Traffic::from_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => sim::Traffic::default(),
    };
    if !options.json {
        eprintln!("{} {}", style("running").cyan().bold(), config);
    }

    let mut host = sim::Host::new(&config, traffic, options.seed)?;
    host.run(options.cycles)?;
    host.drain()?;
    let summary = host.summary();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }

    if let Some(path) = &options.save_state {
        let checkpoint = host.controller.save_state()?;
        std::fs::write(path, checkpoint)
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        eprintln!("{} {}", style("saved").green(), path.display());
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    let mut logger = env_logger::Builder::from_default_env();
    match options.verbose {
        0 => {}
        1 => {
            logger.filter_level(log::LevelFilter::Info);
        }
        2 => {
            logger.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            logger.filter_level(log::LevelFilter::Trace);
        }
    }
    logger.init();

    match &options.command {
        Command::Run(run_options) => run(run_options),
        Command::DefaultConfig => {
            print!("{}", serde_yaml::to_string(&config::Cache::default())?);
            Ok(())
        }
    }
}
