//! # Log Collector - File Tailing and Container Output
//!
//! Tail-follows a configured set of files plus recent container
//! stdout/stderr. Per-file byte positions live in memory only; a file
//! whose size shrank below the stored offset is treated as rotated and
//! re-read from zero. Each line is classified by case-insensitive word
//! match, noise is dropped (blank lines, comments, healthcheck pings,
//! successful HTTP 200s), and a set of always-keep patterns retains the
//! lines that matter most regardless of level. Messages are truncated to
//! 500 characters.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use tracing::warn;

use crate::config::LogCollectorConfig;
use crate::wire::{unix_now, LogEntry, LogLevel};

const MAX_MESSAGE_CHARS: usize = 500;

static LEVEL_PATTERNS: Lazy<Vec<(LogLevel, Regex)>> = Lazy::new(|| {
    vec![
        (
            LogLevel::Critical,
            Regex::new(r"(?i)\b(CRITICAL|FATAL|PANIC|EMERGENCY)\b").unwrap(),
        ),
        (
            LogLevel::Error,
            Regex::new(r"(?i)\b(ERROR|ERR|FAIL|FAILED|EXCEPTION)\b").unwrap(),
        ),
        (
            LogLevel::Warning,
            Regex::new(r"(?i)\b(WARNING|WARN|ALERT)\b").unwrap(),
        ),
        (
            LogLevel::Info,
            Regex::new(r"(?i)\b(INFO|NOTICE|DEBUG)\b").unwrap(),
        ),
    ]
});

static NOISE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"^\s*$",
        r"^#",
        r"(?i)healthcheck",
        r"(?i)GET /health",
        r#"HTTP/1\.[01]" 200"#,
    ])
    .unwrap()
});

static IMPORTANT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)out of memory",
        r"(?i)killed process",
        r"(?i)segfault",
        r"(?i)kernel panic",
        r"(?i)disk full",
        r"(?i)connection refused",
        r"(?i)permission denied",
        r"(?i)authentication fail",
        r"(?i)ssl.*error",
        r"(?i)certificate.*expir",
    ])
    .unwrap()
});

pub(crate) fn detect_level(line: &str) -> LogLevel {
    for (level, pattern) in LEVEL_PATTERNS.iter() {
        if pattern.is_match(line) {
            return *level;
        }
    }
    LogLevel::Info
}

pub(crate) fn is_noise(line: &str) -> bool {
    NOISE_PATTERNS.is_match(line)
}

pub(crate) fn is_important(line: &str) -> bool {
    IMPORTANT_PATTERNS.is_match(line)
}

/// A line is shipped when it is at least a warning or matches an
/// always-keep pattern.
fn should_keep(line: &str, level: LogLevel) -> bool {
    !matches!(level, LogLevel::Info) || is_important(line)
}

fn truncate_message(line: &str) -> String {
    line.trim().chars().take(MAX_MESSAGE_CHARS).collect()
}

/// `/var/log/nginx/error.log` -> `nginx`
pub(crate) fn extract_service(path: &Path) -> Option<String> {
    let mut components = path.components().map(|c| c.as_os_str().to_string_lossy());
    while let Some(component) = components.next() {
        if component == "log" {
            return components.next().and_then(|next| {
                // a file directly under /var/log has no service directory
                if next.contains('.') {
                    None
                } else {
                    Some(next.into_owned())
                }
            });
        }
    }
    None
}

/// One collection cycle's worth of log entries.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub timestamp: f64,
    pub host: String,
    pub entries: Vec<LogEntry>,
    pub total_lines_processed: usize,
    pub errors_count: usize,
    pub warnings_count: usize,
}

/// File and container log tailer.
pub struct LogCollector {
    host: String,
    paths: Vec<PathBuf>,
    docker_logs: bool,
    positions: Arc<DashMap<PathBuf, u64>>,
}

impl LogCollector {
    pub fn new(config: &LogCollectorConfig, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            paths: config.paths.iter().map(PathBuf::from).collect(),
            docker_logs: config.docker_logs,
            positions: Arc::new(DashMap::new()),
        }
    }

    /// Collect new lines from every source, bounded by `max_lines` kept
    /// entries overall.
    pub async fn collect(&self, max_lines: usize) -> LogBatch {
        let mut entries = Vec::new();
        let mut total_lines = 0usize;

        let existing: Vec<PathBuf> = self.paths.iter().filter(|p| p.exists()).cloned().collect();
        if !existing.is_empty() {
            let per_file = (max_lines / existing.len()).max(1);
            for path in existing {
                let positions = Arc::clone(&self.positions);
                let host = self.host.clone();
                let result = tokio::task::spawn_blocking(move || {
                    collect_from_file(&positions, &path, per_file, &host)
                })
                .await;
                match result {
                    Ok((file_entries, lines)) => {
                        entries.extend(file_entries);
                        total_lines += lines;
                    }
                    Err(e) => warn!("log file task failed: {e}"),
                }
            }
        }

        if self.docker_logs {
            entries.extend(self.collect_docker_logs(max_lines / 2).await);
        }

        let errors = entries
            .iter()
            .filter(|e| e.level.is_urgent())
            .count();
        let warnings = entries
            .iter()
            .filter(|e| e.level == LogLevel::Warning)
            .count();

        LogBatch {
            timestamp: unix_now(),
            host: self.host.clone(),
            entries,
            total_lines_processed: total_lines,
            errors_count: errors,
            warnings_count: warnings,
        }
    }

    /// Tail recent stdout/stderr of running containers, best-effort.
    async fn collect_docker_logs(&self, budget: usize) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let Ok(out) =
            super::run_command("docker", &["ps", "--format", "{{.Names}}"], 10).await
        else {
            return entries;
        };

        let containers: Vec<&str> = out.lines().filter(|l| !l.is_empty()).take(20).collect();
        if containers.is_empty() {
            return entries;
        }
        let per_container = (budget / containers.len()).max(10).to_string();

        for container in containers {
            let Ok(logs) = super::run_command(
                "docker",
                &["logs", container, "--since", "1m", "--tail", &per_container],
                5,
            )
            .await
            else {
                continue;
            };

            for line in logs.lines() {
                if line.is_empty() || is_noise(line) {
                    continue;
                }
                let level = detect_level(line);
                if should_keep(line, level) {
                    entries.push(LogEntry {
                        timestamp: unix_now(),
                        source: format!("docker://{container}"),
                        level,
                        message: truncate_message(line),
                        host: self.host.clone(),
                        container: Some(container.to_string()),
                        service: None,
                    });
                }
            }
        }
        entries
    }
}

/// Read new lines from one file, honoring the stored byte position and
/// resetting it when the file was rotated.
fn collect_from_file(
    positions: &DashMap<PathBuf, u64>,
    path: &Path,
    max_entries: usize,
    host: &str,
) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut lines_read = 0usize;

    let read = || -> std::io::Result<(Vec<LogEntry>, usize)> {
        let file_size = std::fs::metadata(path)?.len();
        let stored = positions.get(path).map(|p| *p).unwrap_or(0);
        // a shrunken file means rotation: start over from zero
        let start = if stored > file_size { 0 } else { stored };

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let new_position = start + bytes.len() as u64;

        let content = String::from_utf8_lossy(&bytes);
        let mut kept = Vec::new();
        let mut count = 0usize;
        for line in content.lines() {
            count += 1;
            if kept.len() >= max_entries {
                break;
            }
            if is_noise(line) {
                continue;
            }
            let level = detect_level(line);
            if should_keep(line, level) {
                kept.push(LogEntry {
                    timestamp: unix_now(),
                    source: path.to_string_lossy().into_owned(),
                    level,
                    message: truncate_message(line),
                    host: host.to_string(),
                    container: None,
                    service: extract_service(path),
                });
            }
        }

        positions.insert(path.to_path_buf(), new_position);
        Ok((kept, count))
    };

    match read() {
        Ok((kept, count)) => {
            entries = kept;
            lines_read = count;
        }
        Err(e) => {
            entries.push(LogEntry {
                timestamp: unix_now(),
                source: path.to_string_lossy().into_owned(),
                level: LogLevel::Error,
                message: format!("Failed to read log file: {e}"),
                host: host.to_string(),
                container: None,
                service: None,
            });
        }
    }

    (entries, lines_read)
}
