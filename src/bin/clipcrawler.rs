use std::path::PathBuf;
use std::sync::Arc;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use clipcrawler_engine::config::{self, ScanMode};
use clipcrawler_engine::http::UreqTransport;
use clipcrawler_engine::ledger::DownloadLedger;
use clipcrawler_engine::paths::AppPaths;
use clipcrawler_engine::scraper::{Scraper, ScraperConfig};
use clipcrawler_engine::state::ScanState;
use clipcrawler_engine::status::StatusSink;
use clipcrawler_engine::{db, gallery, library, proxies};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "clipcrawler", author, version, about = "Polls Discord channels for video attachments and builds a browsable gallery")]
struct Args {
    /// Directory holding config, state and logs
    #[arg(long, env = "CLIPCRAWLER_BASE_DIR", global = true)]
    base_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start polling until Ctrl-C
    Run {
        /// Scan every channel once and exit
        #[arg(long)]
        once: bool,
    },
    #[command(subcommand)]
    Channel(ChannelCommand),
    #[command(subcommand)]
    Proxy(ProxyCommand),
    #[command(subcommand)]
    Token(TokenCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Regenerate the HTML gallery from the metadata store
    Gallery,
    /// Write every metadata record to a CSV file
    ExportCsv { out: PathBuf },
    /// Summarize configuration and progress
    Status,
}

#[derive(Subcommand, Debug)]
enum ChannelCommand {
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// `full_scan` or `new_only`
        #[arg(long, default_value = "new_only", value_parser = parse_mode)]
        mode: ScanMode,
    },
    Remove {
        id: String,
    },
    Mode {
        id: String,
        #[arg(value_parser = parse_mode)]
        mode: ScanMode,
    },
    List,
    /// Forget scan cursors so the channel is walked again from the newest message
    Reset {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    List,
    Add {
        #[arg(required = true)]
        proxies: Vec<String>,
    },
    Remove {
        proxy: String,
    },
    Clear,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    Set { value: String },
    Clear,
    Show,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    /// Empty string restores the default location
    DownloadDir { path: String },
    UseProxies {
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        enabled: bool,
    },
}

fn main() -> Result<(), String> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let base_dir = args
        .base_dir
        .clone()
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    proxies::ensure_proxy_file(&paths.proxies_path()).map_err(|e| e.to_string())?;
    DownloadLedger::ensure_file(&paths.ledger_path()).map_err(|e| e.to_string())?;

    match args.command {
        Commands::Run { once } => run(paths, once),
        Commands::Channel(cmd) => channel(&paths, cmd),
        Commands::Proxy(cmd) => proxy(&paths, cmd),
        Commands::Token(cmd) => token(&paths, cmd),
        Commands::Settings(cmd) => settings(&paths, cmd),
        Commands::Gallery => {
            let settings = config::load_settings(&paths).map_err(|e| e.to_string())?;
            let download_dir = config::effective_download_dir(&paths, &settings);
            let stats = gallery::rebuild(&download_dir, settings.tuning.videos_per_page())
                .map_err(|e| e.to_string())?;
            println!(
                "Gallery: {} videos on {} pages ({} missing files skipped)",
                stats.videos, stats.pages, stats.skipped
            );
            println!("Index: {}", download_dir.join(gallery::INDEX_FILE).display());
            Ok(())
        }
        Commands::ExportCsv { out } => {
            let settings = config::load_settings(&paths).map_err(|e| e.to_string())?;
            let download_dir = config::effective_download_dir(&paths, &settings);
            let rows = library::export_csv(&download_dir, &out).map_err(|e| e.to_string())?;
            println!("Exported {rows} records to {}", out.display());
            Ok(())
        }
        Commands::Status => status(&paths),
    }
}

fn run(paths: AppPaths, once: bool) -> Result<(), String> {
    let config = ScraperConfig::load(paths.clone()).map_err(|e| e.to_string())?;
    if config.settings.channels.is_empty() {
        return Err("no channels configured (try `channel add <id>`)".to_string());
    }
    db::ensure_schema(&config.download_dir).map_err(|e| e.to_string())?;

    let sink = StatusSink::new(Some(&paths));
    let mut scraper =
        Scraper::new(config, Arc::new(UreqTransport), sink).map_err(|e| e.to_string())?;

    let control = scraper.control();
    ctrlc::set_handler(move || control.request_stop())
        .map_err(|e| format!("failed to install Ctrl-C handler: {e}"))?;

    if once {
        let saved = scraper.run_once();
        println!("Cycle finished: {saved} new videos");
        return Ok(());
    }

    let handle = scraper.spawn().map_err(|e| e.to_string())?;
    handle.join();
    Ok(())
}

fn channel(paths: &AppPaths, cmd: ChannelCommand) -> Result<(), String> {
    let mut settings = config::load_settings(paths).map_err(|e| e.to_string())?;
    match cmd {
        ChannelCommand::Add { id, name, mode } => {
            let ch = config::upsert_channel(&mut settings, &id, name.as_deref(), mode)
                .map_err(|e| e.to_string())?;
            config::save_settings(paths, &settings).map_err(|e| e.to_string())?;
            println!("Channel {} ({}) set to {}", ch.id, ch.name, ch.mode.as_str());
        }
        ChannelCommand::Remove { id } => {
            if !config::remove_channel(&mut settings, &id) {
                return Err(format!("channel {id} is not configured"));
            }
            config::save_settings(paths, &settings).map_err(|e| e.to_string())?;
            println!("Channel {id} removed");
        }
        ChannelCommand::Mode { id, mode } => {
            let name = settings
                .channel(id.trim())
                .map(|c| c.name.clone())
                .ok_or_else(|| format!("channel {id} is not configured"))?;
            config::upsert_channel(&mut settings, &id, Some(&name), mode)
                .map_err(|e| e.to_string())?;
            config::save_settings(paths, &settings).map_err(|e| e.to_string())?;
            println!("Channel {id} set to {}", mode.as_str());
        }
        ChannelCommand::List => {
            if settings.channels.is_empty() {
                println!("No channels configured.");
            }
            let state = ScanState::load(&paths.scan_state_path());
            for ch in &settings.channels {
                let cursor = state.cursor(&ch.id);
                let history = match ch.mode {
                    ScanMode::NewOnly => "-",
                    ScanMode::FullScan if cursor.history_complete => "complete",
                    ScanMode::FullScan => "in progress",
                };
                println!(
                    "{}\t{}\t{}\thistory: {}",
                    ch.id,
                    ch.mode.as_str(),
                    ch.name,
                    history
                );
            }
        }
        ChannelCommand::Reset { id } => {
            let mut state = ScanState::load(&paths.scan_state_path());
            if state.reset(id.trim()) {
                state.save().map_err(|e| e.to_string())?;
                println!("Scan state for {id} cleared");
            } else {
                println!("No scan state recorded for {id}");
            }
        }
    }
    Ok(())
}

fn proxy(paths: &AppPaths, cmd: ProxyCommand) -> Result<(), String> {
    let path = paths.proxies_path();
    let mut list = proxies::load_proxies(&path).map_err(|e| e.to_string())?;
    match cmd {
        ProxyCommand::List => {
            if list.is_empty() {
                println!("No proxies configured.");
            }
            for p in &list {
                println!("{p}");
            }
            return Ok(());
        }
        ProxyCommand::Add { proxies: raw } => {
            let mut added = 0;
            for entry in raw {
                let Some(p) = proxies::normalize_proxy(&entry) else {
                    return Err(format!("not a proxy address: {entry:?}"));
                };
                if !list.contains(&p) {
                    list.push(p);
                    added += 1;
                }
            }
            println!("Added {added} proxies ({} total)", list.len());
        }
        ProxyCommand::Remove { proxy } => {
            let target = proxies::normalize_proxy(&proxy).unwrap_or(proxy);
            let before = list.len();
            list.retain(|p| p != &target);
            if list.len() == before {
                return Err(format!("proxy {target} is not in the list"));
            }
            println!("Removed {target}");
        }
        ProxyCommand::Clear => {
            list.clear();
            println!("Proxy list cleared");
        }
    }
    proxies::save_proxies(&path, &list).map_err(|e| e.to_string())
}

fn token(paths: &AppPaths, cmd: TokenCommand) -> Result<(), String> {
    match cmd {
        TokenCommand::Set { value } => {
            let value = value.trim();
            if value.is_empty() {
                return Err("token is empty".to_string());
            }
            config::save_token(paths, value).map_err(|e| e.to_string())?;
            println!("Token saved to {}", paths.token_path().display());
        }
        TokenCommand::Clear => {
            config::clear_token(paths).map_err(|e| e.to_string())?;
            println!("Token cleared");
        }
        TokenCommand::Show => match config::resolve_token(paths).map_err(|e| e.to_string())? {
            Some(t) => println!("Token: {}", config::redact_token(&t)),
            None => println!("Token: (not set; use `token set` or {})", config::TOKEN_ENV_VAR),
        },
    }
    Ok(())
}

fn settings(paths: &AppPaths, cmd: SettingsCommand) -> Result<(), String> {
    let mut settings = config::load_settings(paths).map_err(|e| e.to_string())?;
    match cmd {
        SettingsCommand::Show => {
            let json = serde_json::to_string_pretty(&settings).map_err(|e| e.to_string())?;
            println!("{json}");
            println!(
                "Effective download dir: {}",
                config::effective_download_dir(paths, &settings).display()
            );
            return Ok(());
        }
        SettingsCommand::DownloadDir { path } => {
            let trimmed = path.trim();
            settings.download_dir = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        SettingsCommand::UseProxies { enabled } => settings.use_proxies = enabled,
    }
    config::save_settings(paths, &settings).map_err(|e| e.to_string())?;
    println!("Settings saved to {}", paths.settings_path().display());
    Ok(())
}

fn status(paths: &AppPaths) -> Result<(), String> {
    let settings = config::load_settings(paths).map_err(|e| e.to_string())?;
    let download_dir = config::effective_download_dir(paths, &settings);
    let ledger = DownloadLedger::load(&paths.ledger_path());
    let state = ScanState::load(&paths.scan_state_path());
    let proxy_count = proxies::load_proxies(&paths.proxies_path())
        .map_err(|e| e.to_string())?
        .len();
    let records = if db::exists(&download_dir) {
        library::count_records(&download_dir).map_err(|e| e.to_string())?
    } else {
        0
    };
    let token = config::resolve_token(paths).map_err(|e| e.to_string())?;

    println!("Base dir: {}", paths.base_dir.display());
    println!("Download dir: {}", download_dir.display());
    println!(
        "Token: {}",
        token
            .as_deref()
            .map(config::redact_token)
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!(
        "Proxies: {proxy_count} ({})",
        if settings.use_proxies { "enabled" } else { "disabled" }
    );
    println!("Channels: {}", settings.channels.len());
    let complete = settings
        .channels
        .iter()
        .filter(|c| c.mode == ScanMode::FullScan && state.cursor(&c.id).history_complete)
        .count();
    println!("Full history scans complete: {complete}");
    println!("Downloaded attachments: {}", ledger.len());
    println!("Metadata records: {records}");
    Ok(())
}

fn parse_mode(raw: &str) -> Result<ScanMode, String> {
    ScanMode::parse(raw).ok_or_else(|| format!("unknown scan mode {raw:?} (use full_scan or new_only)"))
}

fn init_logging(verbose: bool, quiet: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(log_filter(verbose, quiet, rust_log.as_deref()))
        .with(fmt::layer().with_target(false))
        .init();
}

/// `-q` and `-v` win over `RUST_LOG`; an unset or unparsable `RUST_LOG` means `info`.
fn log_filter(verbose: bool, quiet: bool, rust_log: Option<&str>) -> EnvFilter {
    if quiet {
        return EnvFilter::new("error");
    }
    if verbose {
        return EnvFilter::new("debug");
    }
    rust_log
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn default_base_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("clipcrawler"));
            }
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let t = home.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join(".clipcrawler"));
        }
    }
    std::env::current_dir().ok().map(|d| d.join("clipcrawler-data"))
}
