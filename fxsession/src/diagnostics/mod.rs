//! Offline analysis of reconnect behaviour recorded in session logs.

mod reconnect;

pub use reconnect::{
    analyze, render, EventKind, ReconnectEvent, ReconnectEvents, ReconnectStats,
};

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Directories never searched when looking for a log by name.
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
];

/// A log file located by [`resolve_log_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLog {
    pub path: PathBuf,
    /// Set when the file was found somewhere other than where it was asked for
    pub note: Option<String>,
}

/// Analyze the log file at `path`.
pub fn analyze_file(path: &Path) -> io::Result<ReconnectStats> {
    analyze(BufReader::new(File::open(path)?))
}

/// Locate `requested` relative to `cwd`.
///
/// An existing path is used as is. A bare file name that does not exist is searched for
/// below `cwd`; with several matches the most recently modified one wins. Explicit paths
/// that do not exist are never guessed.
pub fn resolve_log_file(requested: &Path, cwd: &Path) -> Option<ResolvedLog> {
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        cwd.join(requested)
    };
    if candidate.exists() {
        return Some(ResolvedLog {
            path: candidate,
            note: None,
        });
    }

    let is_bare_name = requested.components().count() == 1
        && matches!(requested.components().next(), Some(Component::Normal(_)));
    if !is_bare_name {
        return None;
    }
    let name = requested.file_name()?.to_str()?;

    let mut matches = find_by_name(cwd, name);
    match matches.len() {
        0 => None,
        1 => {
            let path = matches.remove(0);
            let note = format!(
                "info: log file not found at '{}', using discovered file '{}'.",
                requested.display(),
                path.display()
            );
            Some(ResolvedLog {
                path,
                note: Some(note),
            })
        }
        count => {
            let path = matches.into_iter().max_by_key(|path| modified(path))?;
            let note = format!(
                "info: found {} files named '{}', using latest '{}'.",
                count,
                name,
                path.display()
            );
            Some(ResolvedLog {
                path,
                note: Some(note),
            })
        }
    }
}

fn find_by_name(root: &Path, name: &str) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        glob::Pattern::escape(name)
    );
    let Ok(paths) = glob::glob(&pattern) else {
        return Vec::new();
    };

    paths
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .filter(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            !relative.components().any(|component| match component {
                Component::Normal(dir) => dir
                    .to_str()
                    .is_some_and(|dir| SKIPPED_DIRS.contains(&dir)),
                _ => false,
            })
        })
        .collect()
}

fn modified(path: &Path) -> SystemTime {
    path.metadata()
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
