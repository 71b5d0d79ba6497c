use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use postfeed::config::Config;
use postfeed::feed::{
    self, Backend, ChangeEvent, FileBackend, Filter, Intent, RestBackend, Sort, SortField,
    SortOrder,
};
use postfeed::render::format_snapshot;
use postfeed::server;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Get the default config file path (~/.config/postfeed/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("postfeed")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "postfeed", about = "Paginated, filterable post feed with live updates")]
struct Cli {
    /// Config file (default: ~/.config/postfeed/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the posts file at /api/posts and the static frontend
    Serve {
        /// Posts JSON file (default: {target_user}_threads.json)
        #[arg(long, value_name = "FILE")]
        data_file: Option<PathBuf>,

        #[arg(long, value_name = "DIR")]
        static_dir: Option<PathBuf>,

        /// Listen address, e.g. 127.0.0.1:3000
        #[arg(long)]
        bind: Option<String>,
    },

    /// Follow the feed in the terminal
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Only posts by this author
    #[arg(long)]
    author: Option<String>,

    /// Case-insensitive text search in post content
    #[arg(long)]
    search: Option<String>,

    /// Earliest posted day (YYYY-MM-DD), inclusive
    #[arg(long, value_name = "DATE")]
    from: Option<NaiveDate>,

    /// Latest posted day (YYYY-MM-DD), inclusive
    #[arg(long, value_name = "DATE")]
    to: Option<NaiveDate>,

    /// posted_at, created_at or author
    #[arg(long, default_value = "posted_at")]
    sort: SortField,

    #[arg(long, default_value = "desc")]
    order: SortOrder,

    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: u32,

    /// Read posts from this JSON file instead of the REST backend
    #[arg(long, value_name = "FILE")]
    data_file: Option<PathBuf>,

    /// Read realtime change payloads from stdin, one JSON object per line
    #[arg(long)]
    events_stdin: bool,

    /// Print the loaded window once and exit
    #[arg(long)]
    once: bool,

    /// Output width in columns
    #[arg(long, default_value_t = 100)]
    width: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?
        .with_env();
    tracing::debug!(?config, "Effective configuration");

    match cli.command {
        Command::Serve {
            data_file,
            static_dir,
            bind,
        } => {
            let data_file = data_file.unwrap_or_else(|| config.data_file());
            let static_dir = static_dir.unwrap_or_else(|| config.static_dir.clone());
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            serve(data_file, static_dir, &bind).await
        }
        Command::Watch(args) => watch(&config, args).await,
    }
}

async fn serve(data_file: PathBuf, static_dir: PathBuf, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;
    tracing::info!(
        data_file = %data_file.display(),
        static_dir = %static_dir.display(),
        "Starting server"
    );
    let app = server::router(data_file, static_dir);
    server::serve(listener, app, shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl-C, shutting down gracefully"),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

fn build_backend(config: &Config, data_file: Option<PathBuf>) -> Result<Arc<dyn Backend>> {
    if let Some(path) = data_file {
        return Ok(Arc::new(FileBackend::new(path)));
    }

    let Some(base_url) = &config.backend_url else {
        let path = config.data_file();
        tracing::info!(path = %path.display(), "No backend_url configured, reading posts file");
        let backend = match &config.data_file {
            Some(_) => FileBackend::new(path),
            None => FileBackend::new(path).with_author(&config.target_user),
        };
        return Ok(Arc::new(backend));
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("postfeed/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let backend = RestBackend::new(client, base_url, &config.table, config.api_key())
        .with_context(|| format!("Invalid backend_url: {base_url}"))?;
    Ok(Arc::new(backend))
}

async fn watch(config: &Config, args: WatchArgs) -> Result<()> {
    let backend = build_backend(config, args.data_file)?;

    let mut options = config.session_options();
    options.filter = Filter {
        author: args.author,
        search: args.search,
        date_from: args.from,
        date_to: args.to,
    };
    options.sort = Sort::new(args.sort, args.order);

    let changes = args.events_stdin.then(stdin_changes);
    let feed = feed::spawn(backend, options, changes);
    let mut snapshots = feed.subscribe();
    let mut last_rendered = String::new();

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if !snapshot.loading() {
            let wants_more =
                snapshot.has_more && snapshot.page < args.pages && snapshot.error.is_none();
            if wants_more {
                feed.dispatch(Intent::LoadMore).await?;
            } else {
                let rendered = format_snapshot(&snapshot, args.width);
                if rendered != last_rendered {
                    println!("{rendered}");
                    last_rendered = rendered;
                }
                if args.once {
                    break;
                }
            }
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    tracing::warn!("Feed session stopped");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down gracefully");
                break;
            }
        }
    }

    feed.shutdown().await;
    Ok(())
}

/// Forwards realtime payloads read from stdin into the session.
fn stdin_changes() -> mpsc::Receiver<ChangeEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ChangeEvent::from_realtime_json(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Skipping malformed change payload"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read change payloads from stdin");
                    break;
                }
            }
        }
    });
    rx
}
