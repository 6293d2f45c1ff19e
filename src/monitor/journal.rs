//! Bounded per-job log buffers

use crate::WatchError;
use chrono::Local;
use log::info;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Which of the two buffers to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    /// Service events in console form
    Raw,
    /// Short human-readable summaries
    Friendly,
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalKind::Raw => write!(f, "raw"),
            JournalKind::Friendly => write!(f, "friendly"),
        }
    }
}

impl FromStr for JournalKind {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(JournalKind::Raw),
            "friendly" | "human" => Ok(JournalKind::Friendly),
            other => Err(WatchError::Validation(format!("unknown log kind '{}'", other))),
        }
    }
}

/// Raw and friendly ring buffers of one monitor, oldest line first
#[derive(Debug)]
pub struct Journal {
    job_id: i64,
    capacity: usize,
    raw: Mutex<VecDeque<String>>,
    friendly: Mutex<VecDeque<String>>,
}

impl Journal {
    pub fn new(job_id: i64, capacity: usize) -> Self {
        Self {
            job_id,
            capacity: capacity.max(1),
            raw: Mutex::new(VecDeque::new()),
            friendly: Mutex::new(VecDeque::new()),
        }
    }

    pub fn raw(&self, line: &str) {
        self.push(JournalKind::Raw, line);
    }

    /// Friendly lines are mirrored to the process log
    pub fn friendly(&self, line: &str) {
        info!("[job {}] {}", self.job_id, line);
        self.push(JournalKind::Friendly, line);
    }

    pub fn lines(&self, kind: JournalKind) -> Vec<String> {
        let buffer = self.buffer(kind).lock().unwrap_or_else(|e| e.into_inner());
        buffer.iter().cloned().collect()
    }

    fn buffer(&self, kind: JournalKind) -> &Mutex<VecDeque<String>> {
        match kind {
            JournalKind::Raw => &self.raw,
            JournalKind::Friendly => &self.friendly,
        }
    }

    fn push(&self, kind: JournalKind, line: &str) {
        let stamped = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), line);
        let mut buffer = self.buffer(kind).lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(stamped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_drops_oldest() {
        let journal = Journal::new(1, 2);
        journal.raw("one");
        journal.raw("two");
        journal.raw("three");

        let lines = journal.lines(JournalKind::Raw);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("two"));
        assert!(lines[1].ends_with("three"));
        assert!(journal.lines(JournalKind::Friendly).is_empty());
    }

    #[test]
    fn test_timestamp_prefix() {
        let journal = Journal::new(1, 10);
        journal.friendly("device online");
        let line = &journal.lines(JournalKind::Friendly)[0];
        // "[YYYY-MM-DD HH:MM:SS] "
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[20..22], "] ");
        assert!(line.ends_with("device online"));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("RAW".parse::<JournalKind>().unwrap(), JournalKind::Raw);
        assert_eq!("friendly".parse::<JournalKind>().unwrap(), JournalKind::Friendly);
        assert!("verbose".parse::<JournalKind>().is_err());
    }
}
