//! Bounded tail buffer for streamed process output

use std::time::{Duration, Instant};

/// Keeps the most recent `max_bytes` of output and says when to persist it
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    max_bytes: usize,
    flush_lines: usize,
    flush_interval: Duration,
    unflushed_lines: usize,
    last_flush: Instant,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, flush_lines: usize, flush_interval: Duration) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            flush_lines,
            flush_interval,
            unflushed_lines: 0,
            last_flush: Instant::now(),
        }
    }

    /// Append a line. Returns true when the caller should persist now:
    /// enough lines piled up or the flush interval elapsed.
    pub fn push_line(&mut self, line: &str) -> bool {
        self.text.push_str(line);
        self.text.push('\n');
        self.trim_front();
        self.unflushed_lines += 1;

        self.unflushed_lines >= self.flush_lines || self.last_flush.elapsed() >= self.flush_interval
    }

    /// Mark the current contents as persisted
    pub fn mark_flushed(&mut self) {
        self.unflushed_lines = 0;
        self.last_flush = Instant::now();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    fn trim_front(&mut self) {
        if self.text.len() <= self.max_bytes {
            return;
        }
        let mut cut = self.text.len() - self.max_bytes;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_by_line_count() {
        let mut buf = OutputBuffer::new(1024, 3, Duration::from_secs(3600));
        assert!(!buf.push_line("a"));
        assert!(!buf.push_line("b"));
        assert!(buf.push_line("c"));
        buf.mark_flushed();
        assert!(!buf.push_line("d"));
        assert_eq!(buf.as_str(), "a\nb\nc\nd\n");
    }

    #[test]
    fn test_flush_by_time() {
        let mut buf = OutputBuffer::new(1024, 1000, Duration::ZERO);
        assert!(buf.push_line("first"));
    }

    #[test]
    fn test_keeps_most_recent_bytes() {
        let mut buf = OutputBuffer::new(8, 100, Duration::from_secs(60));
        buf.push_line("0123456789");
        buf.push_line("abc");
        assert_eq!(buf.as_str().len(), 8);
        assert!(buf.as_str().ends_with("abc\n"));

        let mut wide = OutputBuffer::new(5, 100, Duration::from_secs(60));
        wide.push_line("ééé");
        assert!(wide.as_str().len() <= 5);
        assert!(wide.as_str().ends_with("é\n"));
    }
}
