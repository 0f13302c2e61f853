use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info};

use quarrel_core::error::Result;

/// Postmortem artifacts: surface snapshots of agents that never stabilized,
/// and crash records for process faults.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    debug_dir: PathBuf,
    error_dir: PathBuf,
}

impl Diagnostics {
    pub fn new(debug_dir: impl Into<PathBuf>, error_dir: impl Into<PathBuf>) -> Self {
        Self {
            debug_dir: debug_dir.into(),
            error_dir: error_dir.into(),
        }
    }

    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    pub fn error_dir(&self) -> &Path {
        &self.error_dir
    }

    /// Write the full observed surface of a timed-out agent.
    ///
    /// Files are named `<epoch_ms>-<agent>-timeout.html`.
    pub async fn write_snapshot(&self, agent: &str, content: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.debug_dir).await?;
        let path = self.debug_dir.join(format!(
            "{}-{}-timeout.html",
            Utc::now().timestamp_millis(),
            file_safe(agent)
        ));
        tokio::fs::write(&path, content).await?;
        info!(agent, path = %path.display(), "Wrote timeout snapshot");
        Ok(path)
    }

    /// Write a timestamped crash record. Synchronous so it can run from a
    /// panic hook or right before the process exits.
    pub fn write_crash_record(
        &self,
        origin: &str,
        kind: &str,
        message: &str,
        backtrace: &str,
    ) -> std::io::Result<PathBuf> {
        write_crash_record(&self.error_dir, origin, kind, message, backtrace)
    }

    /// Route every panic to a crash record, then terminate with status 1.
    /// There is no automatic restart.
    pub fn install_panic_hook(&self) {
        let error_dir = self.error_dir.clone();
        std::panic::set_hook(Box::new(move |panic_info| {
            let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            let origin = panic_info
                .location()
                .map(|l| format!("panic at {}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "panic".to_string());
            let backtrace = Backtrace::force_capture().to_string();

            match write_crash_record(&error_dir, &origin, "panic", &message, &backtrace) {
                Ok(path) => eprintln!("CRITICAL ERROR: crash record written to {}", path.display()),
                Err(e) => eprintln!("CRITICAL ERROR: {message} (crash record failed: {e})"),
            }
            std::process::exit(1);
        }));
    }
}

fn write_crash_record(
    dir: &Path,
    origin: &str,
    kind: &str,
    message: &str,
    backtrace: &str,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let now = Utc::now();
    let path = dir.join(format!("{}-CRASH.log", now.format("%Y-%m-%dT%H-%M-%S%.3fZ")));
    let content = format!(
        "TIME: {}\nORIGIN: {}\nERROR: {}\nMSG: {}\nBACKTRACE:\n{}\n",
        now.to_rfc3339(),
        origin,
        kind,
        message,
        backtrace
    );
    std::fs::write(&path, content)?;
    error!(path = %path.display(), origin, "Crash record written");
    Ok(path)
}

/// Keep agent names usable as file name fragments.
fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "agent".to_string()
    } else {
        cleaned
    }
}
