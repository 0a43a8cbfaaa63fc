/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Append-only transaction log.
//!
//! The sequence number assigned under the log's lock is the authoritative
//! order; timestamps are informational only. When a history file is
//! configured each event is also appended to it as one JSON line, written
//! under the same lock so the file keeps append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::{PacsmithError, PacsmithResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Build,
    Install,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Fetch => "fetch",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One immutable log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub item: String,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl fmt::Display for TransactionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] {}: {}",
            self.seq,
            self.timestamp.format("%H:%M:%S"),
            self.phase,
            self.item,
            self.message
        )?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit {})", code)?;
        }
        Ok(())
    }
}

struct Inner {
    events: Vec<TransactionEvent>,
    history: Option<File>,
    /// Last seq already in the history file when this session opened it
    seq_base: u64,
}

impl Inner {
    fn last_seq(&self) -> u64 {
        self.events.last().map_or(self.seq_base, |e| e.seq)
    }
}

/// Shared by the executor (writer) and any number of readers
pub struct TransactionLog {
    inner: Mutex<Inner>,
    sender: broadcast::Sender<TransactionEvent>,
    history_path: Option<PathBuf>,
}

const CHANNEL_CAPACITY: usize = 1024;

impl TransactionLog {
    /// In-memory only
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                history: None,
                seq_base: 0,
            }),
            sender,
            history_path: None,
        }
    }

    /// Also append every event to a JSON-lines history file
    pub fn with_history(path: impl Into<PathBuf>) -> PacsmithResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PacsmithError::filesystem(parent, "cannot create history directory", e))?;
        }
        let seq_base = if path.exists() {
            Self::load_history(&path)?.iter().map(|e| e.seq).max().unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PacsmithError::filesystem(&path, "cannot open history file", e))?;

        let log = Self::new();
        {
            let mut inner = log.lock();
            inner.history = Some(file);
            inner.seq_base = seq_base;
        }
        Ok(Self {
            history_path: Some(path),
            ..log
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // events are only ever pushed, so a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and return it with its sequence number
    pub fn append(
        &self,
        item: &str,
        phase: Phase,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> TransactionEvent {
        let mut inner = self.lock();
        let event = TransactionEvent {
            seq: inner.last_seq() + 1,
            timestamp: Utc::now(),
            item: item.to_string(),
            phase,
            message: message.into(),
            exit_code,
        };

        if let Some(file) = inner.history.as_mut() {
            let written = serde_json::to_string(&event)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(file, "{}", line));
            if let Err(e) = written {
                tracing::warn!(error = %e, "failed to append to transaction history");
            }
        }

        inner.events.push(event.clone());
        // no subscribers is fine
        let _ = self.sender.send(event.clone());
        event
    }

    /// Ordered copy of every event so far
    pub fn snapshot(&self) -> Vec<TransactionEvent> {
        self.lock().events.clone()
    }

    /// Events with `seq` greater than `after`
    pub fn since(&self, after: u64) -> Vec<TransactionEvent> {
        let inner = self.lock();
        let start = inner.events.partition_point(|e| e.seq <= after);
        inner.events[start..].to_vec()
    }

    /// Sequence number of the newest event, counting earlier sessions
    /// of the same history file
    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq()
    }

    pub fn events_for(&self, item: &str) -> Vec<TransactionEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.item == item)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.sender.subscribe()
    }

    /// Live events from now on; a lagging reader skips ahead and can
    /// backfill through [`since`](Self::since)
    pub fn stream(&self) -> impl Stream<Item = TransactionEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    pub fn history_path(&self) -> Option<&Path> {
        self.history_path.as_deref()
    }

    /// Read a history file back in append order; malformed lines are skipped
    pub fn load_history(path: &Path) -> PacsmithResult<Vec<TransactionEvent>> {
        let file = File::open(path).map_err(|e| PacsmithError::filesystem(path, "cannot open history file", e))?;

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PacsmithError::filesystem(path, "cannot read history file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransactionEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(line = idx + 1, error = %e, "skipping malformed history line"),
            }
        }
        Ok(events)
    }
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequence_is_append_order() {
        let log = TransactionLog::new();
        log.append("bar", Phase::Fetch, "downloading", None);
        log.append("bar", Phase::Install, "installing", None);
        log.append("bar", Phase::Done, "installed", Some(0));

        let events = log.snapshot();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[2].exit_code, Some(0));
        assert_eq!(log.since(1).len(), 2);
        assert_eq!(log.events_for("bar").len(), 3);
    }

    #[test]
    fn test_snapshot_is_prefix_consistent_under_concurrency() {
        let log = Arc::new(TransactionLog::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.append(&format!("w{}", w), Phase::Build, format!("line {}", i), None);
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            let snapshot = log.snapshot();
            for (idx, event) in snapshot.iter().enumerate() {
                assert_eq!(event.seq, idx as u64 + 1);
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(log.len(), 200);
    }

    #[tokio::test]
    async fn test_stream_delivers_live_events() {
        let log = TransactionLog::new();
        let stream = log.stream();
        tokio::pin!(stream);

        log.append("x", Phase::Build, "cc -c main.c", None);
        let event = stream.next().await.unwrap();
        assert_eq!(event.message, "cc -c main.c");
        assert_eq!(event.seq, 1);
    }

    #[test]
    fn test_history_round_trip_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/history.jsonl");

        let log = TransactionLog::with_history(&path).unwrap();
        log.append("a", Phase::Fetch, "one", None);
        log.append("a", Phase::Failed, "two", Some(2));
        drop(log);

        // a second session appends after the first
        let log = TransactionLog::with_history(&path).unwrap();
        log.append("b", Phase::Done, "three", None);
        drop(log);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();

        let events = TransactionLog::load_history(&path).unwrap();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[1].phase, Phase::Failed);
        assert_eq!(events[1].exit_code, Some(2));
    }

    #[test]
    fn test_reopened_history_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let first = TransactionLog::with_history(&path).unwrap();
        first.append("a", Phase::Fetch, "one", None);
        first.append("a", Phase::Done, "two", None);
        drop(first);

        let second = TransactionLog::with_history(&path).unwrap();
        assert_eq!(second.last_seq(), 2);
        assert!(second.is_empty());
        let event = second.append("b", Phase::Fetch, "three", None);
        second.append("b", Phase::Done, "four", None);
        assert_eq!(event.seq, 3);

        let later: Vec<_> = second.since(3).into_iter().map(|e| e.message).collect();
        assert_eq!(later, vec!["four"]);
        assert_eq!(second.since(0).len(), 2);
    }

    #[test]
    fn test_event_display() {
        let log = TransactionLog::new();
        let event = log.append("x", Phase::Failed, "make failed", Some(2));
        let text = event.to_string();
        assert!(text.starts_with("#1 "));
        assert!(text.ends_with("[failed] x: make failed (exit 2)"));
    }
}
