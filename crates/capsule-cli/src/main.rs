use clap::{Parser, Subcommand};

use capsule_core::RunnerType;

mod commands;

#[derive(Parser)]
#[command(
    name = "capsule",
    about = "Capsule — offline build checks and configuration",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a zip or project directory the way an import would:
    /// entry, runner, manifest, import check and safety scan.
    Analyze {
        /// Zip file or project directory
        #[arg(default_value = ".")]
        path: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Override the detected runner (client-static, react-component, webcontainer)
        #[arg(short, long)]
        runner: Option<RunnerType>,
        /// Keep a single shared top-level directory in zips
        #[arg(long)]
        keep_root: bool,
    },
    /// Check imports against a runner tier's allowlist.
    Imports {
        #[arg(default_value = ".")]
        path: String,
        #[arg(short, long)]
        runner: Option<RunnerType>,
        #[arg(long)]
        keep_root: bool,
    },
    /// Decide whether a capsule may reach a URL, without any network access.
    Egress {
        url: String,
        /// Manifest `net` rule (repeatable)
        #[arg(short = 'a', long = "allow")]
        manifest: Vec<String>,
        /// Deployment allowlist rule (repeatable)
        #[arg(short, long)]
        global: Vec<String>,
    },
    /// Generate or validate capsule.toml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a capsule.toml with all defaults
    Init {
        #[arg(short, long, default_value = "capsule.toml")]
        path: String,
        #[arg(long)]
        force: bool,
    },
    /// Parse and validate a capsule.toml
    Check {
        #[arg(short, long, default_value = "capsule.toml")]
        path: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capsule=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            path,
            format,
            runner,
            keep_root,
        } => commands::analyze::analyze(&path, &format, !keep_root, runner),
        Commands::Imports {
            path,
            runner,
            keep_root,
        } => commands::imports::imports(&path, runner, !keep_root),
        Commands::Egress {
            url,
            manifest,
            global,
        } => commands::egress::run(&url, &manifest, &global),
        Commands::Config { action } => match action {
            ConfigAction::Init { path, force } => commands::config::init(&path, force),
            ConfigAction::Check { path } => commands::config::check(&path),
        },
    }
}
