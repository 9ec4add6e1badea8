//! The f7t command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use f7t::commands;
use f7t::config::Config;
use git_testament::git_testament;
use git_testament::render_testament;
use tracing_log::AsTrace;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
enum Commands {
    /// Lists the systems behind FirecREST and their status.
    Systems(commands::systems::SystemsArgs),

    /// Submits a batch script.
    Submit(commands::submit::SubmitArgs),

    /// Runs concurrent workflows that submit a batch script and print the
    /// job output once it leaves the queue.
    Run(commands::run::RunArgs),

    /// Runs a repository's test suite as a batch job.
    ///
    /// Exits with a non-zero status if the system is not available, the job
    /// does not complete or its output does not report success.
    Ci(commands::ci::CiArgs),

    /// Downloads a remote file through the staging area.
    Download(commands::transfer::DownloadArgs),

    /// Uploads a local file to a system.
    Upload(commands::transfer::UploadArgs),

    /// Displays or initializes the configuration.
    Config(commands::config::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use.
    ///
    /// Defaults to `f7t.toml` in the current directory, if present.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Systems(args) => commands::systems::systems(args, config).await,
        Commands::Submit(args) => commands::submit::submit(args, config).await,
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::Ci(args) => commands::ci::ci(args, config).await,
        Commands::Download(args) => commands::transfer::download(args, config).await,
        Commands::Upload(args) => commands::transfer::upload(args, config).await,
        Commands::Config(args) => commands::config::config(args, config),
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
