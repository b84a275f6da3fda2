mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use kegstand::{Config, KegError};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about = "Manifest-driven package installer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Install prefix (overrides KEG_PREFIX and the config file)
    #[arg(long, global = true)]
    prefix: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages from their manifests
    Install {
        /// Package names or manifest paths
        #[arg(required = true)]
        packages: Vec<String>,

        /// Install from the moving head reference instead of the release
        #[arg(long)]
        head: bool,

        /// Overwrite files already present in the prefix
        #[arg(long)]
        replace: bool,

        /// Fail when declared dependencies are not installed
        #[arg(long)]
        require_deps: bool,

        /// Keep the install when its smoke test fails
        #[arg(long)]
        no_test_fatal: bool,

        /// Extra attempts for transient fetch failures
        #[arg(long)]
        retries: Option<u32>,

        /// Give up on each package after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Uninstall packages
    Uninstall {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Ignore dependents (force uninstall)
        #[arg(long)]
        force: bool,
    },

    /// List installed packages
    List {
        /// Show installed versions
        #[arg(long)]
        versions: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show information about a package manifest
    Info {
        /// Package name or manifest path
        package: String,
    },

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, KegError> {
    let mut config = Config::load()?;
    if let Some(prefix) = cli.prefix {
        config = config.with_prefix(prefix);
    }

    match cli.command {
        Commands::Install {
            packages,
            head,
            replace,
            require_deps,
            no_test_fatal,
            retries,
            timeout,
        } => {
            let options = &mut config.pipeline;
            options.replace |= replace;
            options.fail_test_is_fatal &= !no_test_fatal;
            if require_deps {
                options.dependency_policy = kegstand::DependencyPolicy::Require;
            }
            if let Some(retries) = retries {
                options.fetch_retries = retries;
            }
            if let Some(secs) = timeout {
                options.deadline = Some(std::time::Duration::from_secs(secs));
            }
            commands::install::install(&config, &packages, head).await
        }
        Commands::Uninstall { packages, force } => {
            commands::uninstall::uninstall(&config, &packages, force).await
        }
        Commands::List { versions, json } => {
            commands::list::list(&config, versions, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info { package } => {
            commands::info::info(&config, &package).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            commands::config::config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
