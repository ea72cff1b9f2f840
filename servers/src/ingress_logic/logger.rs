//! Process logging: fern dispatch to stdout and a timestamped file in the
//! configured log directory, with a small retention window so long-running
//! ingress hosts do not accumulate logs.

use anyhow::Result;
use log::LevelFilter;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingress_logic::config::Config;

/// Newest log files kept per host; older ones are removed at startup.
const RETAINED_LOGS: usize = 3;

/// Prefix shared by this binary's log files. Retention only touches files
/// that carry it, so co-located services keep their own logs.
const LOG_PREFIX: &str = "server_ingress";

pub fn init(config: &Config) -> Result<()> {
    fs::create_dir_all(&config.log_dir)?;
    enforce_retention(&config.log_dir)?;

    let level: LevelFilter = config.log_level.parse().unwrap_or(LevelFilter::Info);
    let file_name =
        format!("{}-{}.log", LOG_PREFIX, chrono::Utc::now().format("%Y%m%dT%H%M%SZ"));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(config.log_dir.join(file_name))?)
        .apply()?;

    Ok(())
}

/// Remove all but the newest [`RETAINED_LOGS`] ingress log files. The
/// timestamp embedded in each file name sorts chronologically, so a plain
/// name sort is enough.
fn enforce_retention(log_dir: &Path) -> Result<()> {
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "log")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(LOG_PREFIX))
        })
        .collect();

    logs.sort();
    if logs.len() > RETAINED_LOGS {
        for stale in &logs[..logs.len() - RETAINED_LOGS] {
            if let Err(e) = fs::remove_file(stale) {
                eprintln!("could not remove stale log {}: {}", stale.display(), e);
            }
        }
    }

    Ok(())
}
