use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use github_export::config::LoggingConfig;
use github_export::github::auth;
use github_export::health::CheckResult;
use github_export::{
    Config, ExportReport, Exporter, GitHubClient, HealthCheck, MirrorStore, RepositoryFilter,
    RepositorySource,
};

#[derive(Parser)]
#[command(name = "github-export")]
#[command(about = "Back up every repository of a GitHub account to local mirrors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file with default settings
    Init {
        /// Directory the mirrors are written to
        #[arg(short, long, default_value = "~/github-export")]
        base_dir: String,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Manage authentication
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// List repositories that would be exported
    List {
        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// Export all repositories
    Export {
        /// Show what would be done without cloning or updating anything
        #[arg(long)]
        dry_run: bool,

        /// Update every existing mirror, even if the remote looks unchanged
        #[arg(long)]
        no_skip: bool,

        /// Number of repositories synced in parallel
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show the mirror index and recent runs
    Status {
        /// Only show repositories whose last sync failed
        #[arg(long)]
        failed: bool,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Show which credentials are used and who they belong to
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { base_dir, force } = &cli.command {
        init_logging(cli.verbose, &LoggingConfig::default())?;
        return cmd_init(cli.config.clone(), base_dir, *force);
    }

    let mut config = load_config(cli.config.clone())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting github-export v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config).await,
        Commands::List { details } => cmd_list(details, &config).await,
        Commands::Export {
            dry_run,
            no_skip,
            concurrency,
        } => {
            if let Some(concurrency) = concurrency {
                config.sync.concurrency = concurrency;
                config.validate().context("Invalid --concurrency")?;
            }
            cmd_export(dry_run, no_skip, &config).await
        }
        Commands::Status { failed } => cmd_status(failed, &config),
        Commands::Doctor => cmd_doctor(&config).await,
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid logging.level")?;

    // Logs go to stderr so the report on stdout stays readable
    let layer = match logging.format.as_str() {
        "pretty" => fmt::layer()
            .pretty()
            .with_ansi(logging.color)
            .with_writer(std::io::stderr)
            .boxed(),
        "full" => fmt::layer()
            .with_ansi(logging.color)
            .with_writer(std::io::stderr)
            .boxed(),
        _ => fmt::layer()
            .compact()
            .with_ansi(logging.color)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::load_or_default()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn cmd_init(config_path: Option<PathBuf>, base_dir: &str, force: bool) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    let config = Config {
        base_directory: base_dir.to_string(),
        ..Config::default()
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    config.save(&config_path)?;

    let expanded_base_dir = shellexpand::full(base_dir)?;
    std::fs::create_dir_all(expanded_base_dir.as_ref())
        .with_context(|| format!("Failed to create base directory: {}", expanded_base_dir))?;

    println!("✅ github-export initialized");
    println!("   Config: {}", config_path.display());
    println!("   Base directory: {}", expanded_base_dir);
    println!("   Next: run 'github-export auth status', then 'github-export export'");

    Ok(())
}

async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Status => {
            let (strategy, token) = auth::resolve_token(config)?;
            let client = GitHubClient::new(config, token)?;

            match client.whoami().await {
                Ok(login) => {
                    println!("✅ Authentication successful");
                    println!("   Username: {}", login);
                    println!("   Method: {:?}", strategy);
                }
                Err(e) => {
                    println!("❌ Authentication failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn cmd_list(details: bool, config: &Config) -> Result<()> {
    let (_, token) = auth::resolve_token(config)?;
    let client = GitHubClient::new(config, token)?;
    let filter = RepositoryFilter::from_config(config)?;

    let repositories = filter.apply(client.list_all().await?);

    println!("Repositories ({}):", repositories.len());

    for repo in repositories {
        if details {
            println!("📁 {}", repo.full_name);
            let mut flags = Vec::new();
            if repo.is_private {
                flags.push("private");
            }
            if repo.is_fork {
                flags.push("fork");
            }
            if repo.is_archived {
                flags.push("archived");
            }
            if !flags.is_empty() {
                println!("   🏷️  {}", flags.join(", "));
            }
            if let Some(branch) = &repo.default_branch {
                println!("   🌿 Default branch: {}", branch);
            }
            println!(
                "   🕒 Last activity: {}",
                repo.last_activity().format("%Y-%m-%d %H:%M")
            );
            println!("   🔗 {}", repo.clone_url);
            println!();
        } else {
            println!("  📁 {}", repo.full_name);
        }
    }

    Ok(())
}

async fn cmd_export(dry_run: bool, no_skip: bool, config: &Config) -> Result<()> {
    let (strategy, token) = auth::resolve_token(config)?;
    info!("Using {:?} authentication", strategy);

    let skip_unchanged = !no_skip && config.sync.skip_unchanged;

    if dry_run {
        println!("🔍 Dry run - nothing will be cloned or updated");
        let plan = Exporter::for_plan(config, token)?
            .with_skip_unchanged(skip_unchanged)
            .plan()
            .await?;

        for item in &plan {
            println!(
                "   {:<7} {} -> {}",
                item.action.to_string(),
                item.descriptor.full_name,
                item.local_path.display()
            );
        }
        println!("\n📈 {} repositories planned", plan.len());
        return Ok(());
    }

    let exporter = Exporter::from_config(config, token)?.with_skip_unchanged(skip_unchanged);
    let cancel = exporter.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight repositories");
            cancel.cancel();
        }
    });

    println!("🔄 Exporting repositories to {}", config.base_path().display());
    let report = exporter.run().await?;
    print_report(&report);

    std::process::exit(report.exit_code());
}

fn print_report(report: &ExportReport) {
    println!("\n🎉 Export complete");
    println!("   📊 Total repositories: {}", report.total);
    println!("   📥 Cloned: {}", report.cloned);
    println!("   🔄 Updated: {}", report.updated);
    println!("   ⏭️  Skipped: {}", report.skipped);
    println!("   ❌ Failed: {}", report.failed);
    if report.interrupted {
        println!("   ⏸️  Not attempted: {} (interrupted)", report.not_attempted);
    }
    println!("   ⏱️  Duration: {:.2}s", report.duration.as_secs_f64());

    if report.failed > 0 {
        println!("\n🔍 Failed repositories:");
        for failure in report.failures() {
            println!(
                "   ❌ {}: {}",
                failure.name,
                failure.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        println!("\n💡 Run the export again to retry only the failed repositories");
    }
}

fn cmd_status(failed_only: bool, config: &Config) -> Result<()> {
    let index = config.index_file();
    if !index.exists() {
        println!("No exports yet. Run 'github-export export' first.");
        return Ok(());
    }

    let store = MirrorStore::open(&index, config.base_path(), config.sync.mode)?;
    let records = if failed_only {
        store.failed_records()?
    } else {
        store.records()?
    };

    println!("Mirrors ({}):", records.len());
    for record in &records {
        let icon = if record.last_sync_status.is_success() { "✅" } else { "❌" };
        let synced = record
            .last_synced_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} {} [{}] synced {} -> {}",
            icon,
            record.full_name,
            record.last_sync_status.as_str(),
            synced,
            record.local_path.display()
        );
        if let Some(error) = &record.last_error {
            println!("     {}", error);
        }
    }

    let runs = store.recent_runs(5)?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for run in runs {
            println!(
                "  {} total {}, cloned {}, updated {}, skipped {}, failed {}{}",
                run.started_at.format("%Y-%m-%d %H:%M"),
                run.total,
                run.cloned,
                run.updated,
                run.skipped,
                run.failed,
                if run.interrupted { " (interrupted)" } else { "" }
            );
        }
    }

    Ok(())
}

async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 github-export System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
