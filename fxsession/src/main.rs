use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use fxsession::diagnostics::{analyze_file, render, resolve_log_file};
use fxsession::log_buffer::LogHistory;
use fxsession::{EventBus, RuntimeSettings};

const DEFAULT_LOG_FILE: &str = "live_soak.log";

fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    let settings = RuntimeSettings::new()?;
    settings.validate().map_err(anyhow::Error::msg)?;
    let (log_path, _guard) =
        fxsession::logging::init_logging(&settings, EventBus::new(), LogHistory::default())?;
    tracing::debug!(log = %log_path.display(), "logging initialized");

    let requested = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    let cwd = std::env::current_dir()?;

    let Some(resolved) = resolve_log_file(&requested, &cwd) else {
        println!("log file not found: {} (cwd: {})", requested.display(), cwd.display());
        println!("tip: pass the full path or run from the directory holding the log");
        return Ok(ExitCode::from(2));
    };
    if let Some(note) = &resolved.note {
        println!("{}", note);
    }

    let stats = analyze_file(&resolved.path)?;
    tracing::info!(
        path = %resolved.path.display(),
        lines = stats.lines,
        malformed = stats.malformed_lines,
        "reconnect log analyzed"
    );
    println!("log_file: {}", resolved.path.display());
    println!("{}", render(&stats));

    Ok(ExitCode::SUCCESS)
}
