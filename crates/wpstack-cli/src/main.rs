//! wpstack CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "wpstack")]
#[command(about = "WordPress on Fargate: stacks and delivery pipeline", long_about = None)]
struct Cli {
    /// Settings file (KDL); environment variables override its values
    #[arg(long, short, env = "WPSTACK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize a stack template
    Synth {
        #[command(subcommand)]
        stack: SynthCommands,
    },
    /// Validate settings, pipeline and build spec
    Validate {
        /// Pipeline definition (KDL); defaults to the WordPress pipeline
        #[arg(long)]
        pipeline: Option<PathBuf>,
        /// Build spec (KDL); defaults to the WordPress build spec
        #[arg(long)]
        buildspec: Option<PathBuf>,
    },
    /// Print the image tag derived from a source revision
    Tag {
        /// Source revision (commit id)
        revision: Option<String>,
    },
    /// Run the pipeline locally: git checkout, Docker build, Kubernetes rollout
    Run(commands::run::RunArgs),
}

#[derive(Subcommand)]
enum SynthCommands {
    /// Source and image repositories
    Base {
        /// Output directory for templates
        #[arg(long, default_value = commands::synth::DEFAULT_OUT_DIR)]
        out: PathBuf,
    },
    /// Network, database, service and delivery pipeline
    Pipeline {
        /// Output directory for templates
        #[arg(long, default_value = commands::synth::DEFAULT_OUT_DIR)]
        out: PathBuf,
        /// Pipeline definition (KDL); defaults to the WordPress pipeline
        #[arg(long)]
        pipeline: Option<PathBuf>,
        /// Build spec (KDL); defaults to the WordPress build spec
        #[arg(long)]
        buildspec: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Synth { stack } => match stack {
            SynthCommands::Base { out } => {
                commands::synth::base(config, &out)?;
            }
            SynthCommands::Pipeline {
                out,
                pipeline,
                buildspec,
            } => {
                commands::synth::pipeline(config, &out, pipeline.as_deref(), buildspec.as_deref())?;
            }
        },
        Commands::Validate {
            pipeline,
            buildspec,
        } => {
            commands::validate(config, pipeline.as_deref(), buildspec.as_deref())?;
        }
        Commands::Tag { revision } => {
            commands::tag(revision.as_deref());
        }
        Commands::Run(args) => {
            commands::run::run(config, args).await?;
        }
    }

    Ok(())
}
