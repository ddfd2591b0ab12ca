use crate::events::{Event, EventLog};
use crate::types::JobId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const FLUSH_THRESHOLD: usize = 100;

/// Event log written as gzip-compressed JSON Lines, one file per job per day.
///
/// Layout: `<base>/events/YYYY/MM/DD/<job_id>.jsonl.gz`. Each flush appends
/// a new gzip member, so files are never rewritten.
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: Mutex<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join("events"))
            .context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: Mutex::new(Vec::new()),
        })
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    fn event_log_path(&self, job_id: &JobId, date: NaiveDate) -> PathBuf {
        self.day_dir(date).join(format!("{}.jsonl.gz", job_id))
    }

    async fn flush(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.buffer.lock().await);
        if pending.is_empty() {
            return Ok(());
        }

        let mut grouped: BTreeMap<(String, NaiveDate), (JobId, Vec<Event>)> = BTreeMap::new();
        for event in pending {
            let key = (event.job_id.to_string(), event.timestamp.date_naive());
            grouped
                .entry(key)
                .or_insert_with(|| (event.job_id, Vec::new()))
                .1
                .push(event);
        }

        for ((_, date), (job_id, events)) in grouped {
            let path = self.event_log_path(&job_id, date);
            let member = encode_member(&events)?;
            tokio::task::spawn_blocking(move || append_member(&path, &member))
                .await
                .context("Event log writer panicked")??;
        }

        Ok(())
    }

    fn log_files(&self, job_id: &JobId) -> Result<Vec<PathBuf>> {
        let filename = format!("{}.jsonl.gz", job_id);
        let mut files = Vec::new();

        for year in sorted_subdirs(&self.base_path.join("events"))? {
            for month in sorted_subdirs(&year)? {
                for day in sorted_subdirs(&month)? {
                    let file = day.join(&filename);
                    if file.is_file() {
                        files.push(file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn encode_member(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        serde_json::to_writer(&mut encoder, event).context("Failed to serialize event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    encoder.finish().context("Failed to finish compression")
}

fn append_member(path: &Path, member: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    file.write_all(member).context("Failed to append to event log")?;
    file.sync_data().context("Failed to sync event log")
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("Failed to parse event")?);
    }
    Ok(events)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let len = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event);
            buffer.len()
        };

        if len >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    async fn get_job_events(&self, job_id: JobId) -> Result<Vec<Event>> {
        self.flush().await?;

        let files = self.log_files(&job_id)?;
        let mut events = tokio::task::spawn_blocking(move || -> Result<Vec<Event>> {
            let mut all = Vec::new();
            for file in files {
                all.extend(read_jsonl_gz(&file)?);
            }
            Ok(all)
        })
        .await
        .context("Event log reader panicked")??;

        // Stable: events with equal timestamps keep their append order
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn flush_all(&self) -> Result<()> {
        self.flush().await
    }
}
