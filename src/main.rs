use std::{io, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ollama_session::{
    ConfigLoader, ConversationState, HttpTransport, InferenceConnection, ModelCatalog, Transport,
};
use ratatui::prelude::*;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod app;

use app::{run_app, App, AppEvent};

#[derive(Parser, Debug)]
#[command(name = "ollama-tui", version, about = "Terminal chat for a local Ollama server")]
struct Cli {
    /// Config file merged on top of the global and project files
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend URL, overrides every config source
    #[arg(long)]
    base_url: Option<String>,

    /// Log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// The terminal belongs to the UI, so logs go to a file.
fn init_logging(verbose: u8, log_dir: &std::path::Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::never(log_dir, "ollama-tui.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
        config.validate()?;
    }
    let log_dir = config
        .log_dir
        .clone()
        .unwrap_or_else(ConfigLoader::default_log_dir);
    let _log_guard = init_logging(cli.verbose, &log_dir)?;
    info!("starting ollama-tui");

    // === Dependency Injection ===
    let http = HttpTransport::new(config.base_url.clone());
    info!(base_url = %http.base_url(), "using backend");
    let transport: Arc<dyn Transport> = Arc::new(http);
    let catalog = Arc::new(ModelCatalog::new(transport.clone(), config.list_timeout()));
    let connection = Arc::new(InferenceConnection::new(transport, &config));
    let conversation = ConversationState::new(connection.clone());

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (tx, rx) = mpsc::channel::<AppEvent>(100);
    let mut app = App::new(catalog, connection, conversation, rx, tx);
    app.refresh_models();

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("TUI Error: {}", err);
    }
    info!("exiting");
    Ok(())
}
