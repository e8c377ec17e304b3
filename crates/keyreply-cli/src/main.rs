//! Keyreply CLI
//!
//! Keyword reply administration and the line-delimited `serve` loop

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyreply_config::Config;
use keyreply_core::{IncomingMessage, ReplyEngine, ReplyRuntime};
use keyreply_ipc::{Envelope, EventBus};
use keyreply_render::{describe_chain, render_chain, ContentSegment};
use keyreply_storage::ReplyEntry;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "keyreply")]
#[command(about = "Keyword-triggered auto replies for chat bots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (defaults to core.log_level, then "info" for serve and "warn" otherwise)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or overwrite a keyword reply
    Add {
        keyword: String,
        /// Reply text; use `[img]path` or `[图片]url` lines for images
        raw: String,
        /// Group scope (omit for global)
        #[arg(short, long)]
        scope: Option<String>,
        /// Store the reply disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a keyword reply (scope bucket first, then global)
    Delete {
        keyword: String,
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Enable a keyword reply
    Enable {
        keyword: String,
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Disable a keyword reply
    Disable {
        keyword: String,
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// List keyword replies
    List {
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Run a message through matching and rendering
    Match {
        text: String,
        #[arg(short, long)]
        scope: Option<String>,
        #[arg(long)]
        sender: Option<String>,
        /// Print the chain as JSON
        #[arg(long)]
        json: bool,
    },
    /// Render raw reply text without touching the store
    Render {
        raw: String,
        #[arg(long)]
        json: bool,
    },
    /// Regex fallback replies
    Pattern {
        #[command(subcommand)]
        action: PatternCommands,
    },
    /// Read JSON envelopes from stdin and write replies to stdout
    Serve,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Log file management
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum PatternCommands {
    /// Add a regex reply
    Add { pattern: String, raw: String },
    /// Delete a regex reply by its 1-based index
    Delete { index: usize },
    /// Enable a regex reply
    Enable { index: usize },
    /// Disable a regex reply
    Disable { index: usize },
    /// List regex replies
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show the effective configuration
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum LogCommands {
    /// List log files
    List,
    /// Delete old log files
    Clean {
        #[arg(short, long, default_value_t = logging::LOG_RETENTION_DAYS)]
        days: u64,
    },
    /// Show the last lines of the newest log file
    Tail {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = load_config(cli.config.clone())?;
            let level = effective_log_level(cli.log_level.as_deref(), &config, "info");
            let _guard = logging::init_logging(&config.log_dir(), &level)?;
            serve(&config).await?;
        }
        Commands::Config { action } => run_config_command(action, cli.config)?,
        Commands::Logs { action } => {
            let config = load_config(cli.config.clone())?;
            run_logs_command(action, config.log_dir())?;
        }
        Commands::Render { raw, json } => {
            let config = load_config(cli.config.clone())?;
            let settings = keyreply_core::ReplySettings::from(&config.reply);
            let chain = render_chain(&raw, settings.render_options());
            print_chain(&chain, json)?;
        }
        command => {
            let config = load_config(cli.config.clone())?;
            let level = effective_log_level(cli.log_level.as_deref(), &config, "warn");
            let _guard = logging::init_stderr_logging(&level)?;
            let engine = ReplyEngine::open(&config);
            run_admin_command(&engine, command).await?;
            engine
                .flush()
                .await
                .context("Failed to persist reply data")?;
        }
    }

    Ok(())
}

async fn run_admin_command(engine: &ReplyEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            keyword,
            raw,
            scope,
            disabled,
        } => {
            let enabled = !disabled && engine.settings().default_enabled;
            engine
                .add_reply_with(scope.as_deref(), &keyword, &raw, enabled)
                .await?;
            println!(
                "Saved reply '{}' ({}){}",
                keyword.trim(),
                scope_label(scope.as_deref()),
                if enabled { "" } else { " [disabled]" }
            );
        }
        Commands::Delete { keyword, scope } => {
            engine.delete_reply(scope.as_deref(), &keyword).await?;
            println!("Deleted reply '{}'", keyword.trim());
        }
        Commands::Enable { keyword, scope } => {
            engine
                .set_reply_enabled(scope.as_deref(), &keyword, true)
                .await?;
            println!("Enabled reply '{}'", keyword.trim());
        }
        Commands::Disable { keyword, scope } => {
            engine
                .set_reply_enabled(scope.as_deref(), &keyword, false)
                .await?;
            println!("Disabled reply '{}'", keyword.trim());
        }
        Commands::List { scope } => {
            let listing = engine.list_replies(scope.as_deref()).await;
            print_entries("Global", &listing.global);
            if let Some(scope) = scope.as_deref() {
                print_entries(&format!("Scope {}", scope.trim()), &listing.scope);
            }
        }
        Commands::Match {
            text,
            scope,
            sender,
            json,
        } => {
            let message = IncomingMessage::new(scope.as_deref(), sender.as_deref(), &text);
            match engine.respond(&message).await {
                Some(chain) => print_chain(&chain, json)?,
                None => {
                    if json {
                        println!("null");
                    } else {
                        println!("No reply.");
                    }
                }
            }
        }
        Commands::Pattern { action } => match action {
            PatternCommands::Add { pattern, raw } => {
                let index = engine.add_pattern(&pattern, &raw).await?;
                println!("Saved pattern #{}", index);
            }
            PatternCommands::Delete { index } => {
                engine.delete_pattern(index).await?;
                println!("Deleted pattern #{}", index);
            }
            PatternCommands::Enable { index } => {
                engine.set_pattern_enabled(index, true).await?;
                println!("Enabled pattern #{}", index);
            }
            PatternCommands::Disable { index } => {
                engine.set_pattern_enabled(index, false).await?;
                println!("Disabled pattern #{}", index);
            }
            PatternCommands::List => {
                let rules = engine.list_patterns().await;
                if rules.is_empty() {
                    println!("No patterns.");
                }
                for (i, rule) in rules.iter().enumerate() {
                    println!(
                        "  #{} [{}] /{}/ => {}",
                        i + 1,
                        status_label(rule.enabled),
                        rule.pattern,
                        one_line(&rule.raw)
                    );
                }
            }
        },
        Commands::Serve
        | Commands::Config { .. }
        | Commands::Logs { .. }
        | Commands::Render { .. } => anyhow::bail!("not a reply store command"),
    }
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let engine = Arc::new(ReplyEngine::open(config));
    let bus = EventBus::new();
    let runtime = ReplyRuntime::new(Arc::clone(&engine));

    let inbound = bus.subscribe();
    let outbound_tx = bus.outbound_sender();
    let mut outbound_rx = bus.outbound_subscribe();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match outbound_rx.recv().await {
                Ok(reply) => {
                    let line = match reply.to_json() {
                        Ok(line) => line,
                        Err(e) => {
                            error!("Failed to encode reply {}: {}", reply.trace_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = write_line(&mut stdout, &line).await {
                        error!("Failed to write reply to stdout: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Outbound writer lagged by {} replies", n);
                }
            }
        }
    });

    let processor = tokio::spawn(async move { runtime.run(inbound, outbound_tx).await });

    info!(
        "Serving replies from {} (patterns: {})",
        config.store_path().display(),
        config.pattern_path().display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed, shutting down");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Envelope::from_json(line) {
                    Ok(envelope) => {
                        if let Err(e) = bus.publish(envelope) {
                            warn!("Failed to queue envelope: {}", e);
                        }
                    }
                    Err(e) => warn!("Skipping malformed envelope: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    // Dropping the bus closes the inbound channel; the writer ends once the
    // processor releases its outbound sender.
    drop(bus);
    processor.await?;
    writer.await?;

    engine
        .flush()
        .await
        .context("Failed to persist reply data on shutdown")?;
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

fn run_config_command(action: ConfigCommands, config_path: Option<String>) -> Result<()> {
    match action {
        ConfigCommands::Init { force } => {
            let path = config_path_for(config_path)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, toml::to_string_pretty(&Config::default())?)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommands::Show => match load_config(config_path) {
            Ok(config) => {
                println!("Current configuration:");
                println!("{}", toml::to_string_pretty(&config)?);
                println!("# store:    {}", config.store_path().display());
                println!("# patterns: {}", config.pattern_path().display());
            }
            Err(e) => eprintln!("Error loading config: {}", e),
        },
        ConfigCommands::Validate => match load_config(config_path) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => eprintln!("Configuration is invalid: {}", e),
        },
    }
    Ok(())
}

fn run_logs_command(action: LogCommands, log_dir: PathBuf) -> Result<()> {
    let manager = logging::LogManager::new(log_dir);
    match action {
        LogCommands::List => {
            let files = manager.log_files()?;
            println!(
                "Log files ({} total):\n",
                logging::LogManager::format_size(manager.total_size()?)
            );
            for file in files {
                let metadata = fs::metadata(&file)?;
                let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                println!(
                    "  {} ({}, modified {})",
                    file.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    logging::LogManager::format_size(metadata.len()),
                    modified.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        LogCommands::Clean { days } => {
            let deleted = manager.cleanup_older_than(days)?;
            println!("Cleaned {} old log file(s)", deleted);
        }
        LogCommands::Tail { lines } => match manager.tail(lines)? {
            Some((path, tail)) => {
                println!("==> {} <==", path.display());
                for line in tail {
                    println!("{}", line);
                }
            }
            None => println!("No log files yet."),
        },
    }
    Ok(())
}

/// Explicit `--config` must exist; otherwise the default path is used when present.
fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(&path).with_context(|| format!("Failed to load config {}", path));
    }
    match Config::default_path() {
        Some(default_path) if default_path.exists() => Config::load(&default_path)
            .with_context(|| format!("Failed to load config {}", default_path.display())),
        _ => Ok(Config::default()),
    }
}

fn config_path_for(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().context("Cannot determine a config directory"),
    }
}

fn effective_log_level(cli_level: Option<&str>, config: &Config, fallback: &str) -> String {
    cli_level
        .or(config.core.log_level.as_deref())
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn print_chain(chain: &[ContentSegment], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(chain)?);
    } else if chain.is_empty() {
        println!("(empty)");
    } else {
        println!("{}", describe_chain(chain));
    }
    Ok(())
}

fn print_entries(title: &str, entries: &[ReplyEntry]) {
    println!("{} ({}):", title, entries.len());
    for entry in entries {
        println!("{}", format_entry(entry));
    }
}

fn format_entry(entry: &ReplyEntry) -> String {
    format!(
        "  [{}] {} => {}",
        status_label(entry.enabled),
        entry.keyword,
        one_line(&entry.raw)
    )
}

fn status_label(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn scope_label(scope: Option<&str>) -> String {
    match scope.map(str::trim).filter(|s| !s.is_empty()) {
        Some(scope) => format!("scope {}", scope),
        None => "global".to_string(),
    }
}

fn one_line(raw: &str) -> String {
    raw.replace('\n', "\\n")
}
