//! SchemaGuard Migration CLI Tool
//!
//! Command-line interface for applying SQL migration scripts and inspecting
//! the migration lock. Safe to run from several CI jobs or pods at once: only
//! the lock holder executes a script.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use schemaguard::backend::PgTransactionService;
use schemaguard::config::GuardConfig;
use schemaguard::migration::{generate_instance_id, MigrationRunner};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "schemaguard-migrate")]
#[command(about = "Apply SQL migrations coordinated by a database lock")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Migrations directory path
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Identifier recorded in the ledger and the lock row
    #[arg(long)]
    instance_id: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show migration status (applied vs pending)
    Status,

    /// Apply pending migrations
    Up {
        /// Dry run - show what would be executed without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Show who holds the migration lock
    Lock,

    /// Release the migration lock regardless of its holder
    Unlock,
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = GuardConfig::load().context("failed to load configuration")?;
    if let Some(url) = cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        config.database.url = url;
    }
    if let Some(dir) = cli.migrations_dir {
        config.migrations.scripts_dir = dir;
    }
    let instance_id = cli
        .instance_id
        .or(config.migrations.instance_id)
        .unwrap_or_else(generate_instance_id);

    let service = PgTransactionService::new(config.database.url);
    let runner = MigrationRunner::new(service, &config.migrations.scripts_dir);
    runner
        .ensure_schema()
        .context("failed to create the migration tables")?;

    match cli.command {
        Commands::Status => handle_status(&runner),
        Commands::Up { dry_run } => handle_up(&runner, &instance_id, dry_run, cli.quiet),
        Commands::Lock => handle_lock(&runner),
        Commands::Unlock => handle_unlock(&runner, &instance_id),
    }
}

fn handle_status(runner: &MigrationRunner<PgTransactionService>) -> Result<()> {
    let status = runner.status()?;

    println!("\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        println!("{}", "Applied Migrations: None".green());
    } else {
        println!("{}", format!("Applied Migrations ({}):", status.applied_count).green());
        for row in &status.applied {
            println!(
                "  {} {} ({}, by {})",
                "✓".green(),
                row.script_name,
                row.applied_at.format("%Y-%m-%d %H:%M:%S"),
                row.applied_by
            );
        }
    }

    println!();

    if status.pending.is_empty() {
        println!("{}", "Pending Migrations: None".yellow());
    } else {
        println!("{}", format!("Pending Migrations ({}):", status.pending_count).yellow());
        for script in &status.pending {
            println!("  {} {}", "…".yellow(), script.name);
        }
    }

    println!(
        "\nSummary: {} applied, {} pending",
        status.applied_count, status.pending_count
    );
    Ok(())
}

fn handle_up(
    runner: &MigrationRunner<PgTransactionService>,
    instance_id: &str,
    dry_run: bool,
    quiet: bool,
) -> Result<()> {
    if dry_run {
        let status = runner.status()?;
        if status.is_up_to_date() {
            println!("No pending migrations to apply");
            return Ok(());
        }
        println!("Would apply {} migration(s):", status.pending_count);
        for (i, script) in status.pending.iter().enumerate() {
            println!("  {}. {}", i + 1, script.name);
        }
        return Ok(());
    }

    log::info!("applying migrations from {} as {instance_id}", runner.scripts_dir().display());
    let report = runner.apply_pending(instance_id)?;

    if !quiet {
        for row in &report.applied {
            println!("  {} {}", "applied".green(), row.script_name);
        }
        for name in &report.applied_elsewhere {
            println!("  {} {} (by another instance)", "skipped".blue(), name);
        }
    }
    if !report.is_complete() {
        println!(
            "{} migration lock is held by another instance; deferred: {}",
            "Warning:".yellow().bold(),
            report.deferred.join(", ")
        );
    } else if !quiet {
        println!("{} {} migration(s) applied", "Success:".green().bold(), report.applied.len());
    }
    Ok(())
}

fn handle_lock(runner: &MigrationRunner<PgTransactionService>) -> Result<()> {
    match runner.lock().current()? {
        Some(lock) if lock.is_locked => println!(
            "{} by {} since {}",
            "Locked".red().bold(),
            lock.locked_by.as_deref().unwrap_or("<unknown>"),
            lock.lock_acquired_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "<unknown>".to_string())
        ),
        Some(_) => println!("{}", "Unlocked".green()),
        None => println!("{} (lock row not created yet)", "Unlocked".green()),
    }
    Ok(())
}

fn handle_unlock(runner: &MigrationRunner<PgTransactionService>, instance_id: &str) -> Result<()> {
    let lock = runner.lock();
    if let Some(current) = lock.current()? {
        if current.is_locked {
            log::warn!(
                "releasing migration lock held by {}",
                current.locked_by.as_deref().unwrap_or("<unknown>")
            );
        }
    }
    lock.release(instance_id)?;
    println!("{}", "Migration lock released".green());
    Ok(())
}
