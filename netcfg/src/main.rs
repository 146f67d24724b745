use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

use netcfg_core::allocator::IdFamily;
use netcfg_core::config::Config;
use netcfg_core::observability::init_tracing;
use netcfg_core::ControlPlane;

#[derive(Parser)]
#[command(name = "netcfg")]
#[command(about = "Operator tool for the netcfg control plane", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare allocator nodes with the ids stored on objects
    Audit {
        /// Delete allocation nodes no object refers to
        #[arg(long)]
        clean: bool,
    },
    /// Inspect an id allocator
    Allocator {
        #[command(subcommand)]
        command: AllocatorCommands,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum AllocatorCommands {
    /// List every allocated index with its owner
    List {
        #[arg(value_enum)]
        family: Family,
    },
    /// Show the owner of one index
    Read {
        #[arg(value_enum)]
        family: Family,
        index: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    VirtualNetwork,
    SecurityGroup,
    TagType,
}

impl From<Family> for IdFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::VirtualNetwork => IdFamily::VirtualNetwork,
            Family::SecurityGroup => IdFamily::SecurityGroup,
            Family::TagType => IdFamily::TagType,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let control_plane = ControlPlane::start(config)
        .await
        .context("starting control plane")?;

    match cli.command {
        Commands::Audit { clean } => {
            let reports = control_plane.audit(clean).await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            let unclean = reports.iter().filter(|r| !r.is_clean()).count();
            if clean {
                info!("Audit cleaned stale allocations in {} families", unclean);
            } else if unclean > 0 {
                warn!("Audit found inconsistencies in {} families", unclean);
                control_plane.close().await;
                bail!("allocation audit found inconsistencies");
            }
        }
        Commands::Allocator { command } => match command {
            AllocatorCommands::List { family } => {
                let allocator = control_plane.allocators().family(family.into()).await?;
                for (index, owner) in allocator.allocations().await? {
                    println!("{:>10}  {}", index, owner);
                }
            }
            AllocatorCommands::Read { family, index } => {
                match control_plane.allocators().id_owner(family.into(), index).await? {
                    Some(owner) => println!("{}", owner),
                    None => bail!("index {} is not allocated", index),
                }
            }
        },
        Commands::Config => {}
    }

    control_plane.close().await;
    Ok(())
}
