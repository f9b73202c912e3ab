use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dpf_cli::commands::{decode, masters, process, topology};
use dpf_cli::{Cli, Commands, Config};
use dpf_core::Topology;
use dpf_load::MetaDirLoader;

/// Load config and build the topology, applying the `--arch` override.
fn load_config(cli: &Cli) -> Result<(Config, Topology)> {
    let mut config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(arch) = cli.arch {
        config.arch = arch;
    }
    tracing::debug!(?config, "loaded configuration");
    let topology = config.topology().context("failed to build topology")?;
    Ok((config, topology))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Some(Commands::Decode { file, limit, engine }) => {
            let (config, topology) = load_config(&cli)?;
            let bytes = read_file(file)?;
            let filter = decode::Filter {
                limit: *limit,
                engine: *engine,
            };
            decode::run(&mut out, &bytes, &topology, filter, config.print_quota)?;
        }
        Some(Commands::Masters { file }) => {
            let (_config, topology) = load_config(&cli)?;
            let text = String::from_utf8(read_file(file)?)
                .with_context(|| format!("{} is not UTF-8 text", file.display()))?;
            let failed = masters::run(&mut out, &text, &topology)?;
            if failed > 0 {
                out.flush()?;
                bail!("{failed} lines failed to decode");
            }
        }
        Some(Commands::Topology) => {
            let (_config, topology) = load_config(&cli)?;
            topology::run(&mut out, &topology)?;
        }
        Some(Commands::Process {
            file,
            meta_dir,
            jobs,
            json,
        }) => {
            let (mut config, topology) = load_config(&cli)?;
            if let Some(jobs) = jobs {
                config.jobs = *jobs;
            }
            let meta_dir = meta_dir.as_ref().unwrap_or(&config.meta_dir);
            let loader = MetaDirLoader::new(meta_dir);
            let bytes = read_file(file)?;
            process::run(&mut out, &bytes, &topology, &loader, config.session(), *json)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    out.flush()?;
    Ok(())
}
