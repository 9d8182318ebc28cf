/// Output boundaries: bounded stream collection, log tailing and display truncation
use crossbeam_channel::Sender;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Per-stream collection limits
#[derive(Debug, Clone)]
pub struct OutputLimits {
    /// Per-stream stdout limit (bytes)
    pub stdout_limit: usize,
    /// Per-stream stderr limit (bytes)
    pub stderr_limit: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stdout_limit: 1024 * 1024,
            stderr_limit: 256 * 1024,
        }
    }
}

/// Which pipe a collected buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One finished stream: its bytes and whether the limit cut it short.
#[derive(Debug, Clone)]
pub struct Collected {
    pub stream: Stream,
    pub data: Vec<u8>,
    pub truncated: bool,
}

/// Drain a stream up to `limit` bytes and report it on `tx`.
///
/// Bytes past the limit are read and discarded so the writer never blocks on a
/// full pipe.
pub fn collect_stream<R: Read>(stream: R, which: Stream, limit: usize, tx: Sender<Collected>) {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buffer.len());
                if n > room {
                    buffer.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    let _ = tx.send(Collected {
        stream: which,
        data: buffer,
        truncated,
    });
}

/// Last `lines` lines of a log file, reading at most `max_bytes` from its end.
///
/// A missing file yields an empty string.
pub fn tail_file(path: &Path, lines: usize, max_bytes: u64) -> std::io::Result<String> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut raw = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);

    // When reading from the middle of the file the first line is partial.
    let body = if start > 0 {
        text.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        &text
    };
    Ok(tail_lines(body, lines))
}

/// Keep the last `lines` lines of `text`.
pub fn tail_lines(text: &str, lines: usize) -> String {
    if lines == 0 {
        return String::new();
    }
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    let all: Vec<&str> = trimmed.split('\n').collect();
    let from = all.len().saturating_sub(lines);
    let mut out = all[from..].join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Truncate for display, keeping the most recent `max_chars` characters.
pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_output_limits_default() {
        let limits = OutputLimits::default();
        assert_eq!(limits.stdout_limit, 1024 * 1024);
        assert_eq!(limits.stderr_limit, 256 * 1024);
    }

    #[test]
    fn test_collect_stream_truncates_at_limit() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let input = vec![b'x'; 10_000];
        collect_stream(&input[..], Stream::Stdout, 100, tx);
        let got = rx.recv().unwrap();
        assert_eq!(got.stream, Stream::Stdout);
        assert_eq!(got.data.len(), 100);
        assert!(got.truncated);
    }

    #[test]
    fn test_collect_stream_complete() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        collect_stream(&b"hello"[..], Stream::Stderr, 100, tx);
        let got = rx.recv().unwrap();
        assert_eq!(got.data, b"hello");
        assert!(!got.truncated);
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb\nc", 5), "a\nb\nc");
        assert_eq!(tail_lines("a\nb\nc", 0), "");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_tail_file_reads_from_end() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..200 {
            writeln!(file, "line {}", i).unwrap();
        }
        let tail = tail_file(file.path(), 3, 64).unwrap();
        assert_eq!(tail, "line 197\nline 198\nline 199\n");
    }

    #[test]
    fn test_tail_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tail_file(&dir.path().join("nope.log"), 10, 1024).unwrap(), "");
    }

    #[test]
    fn test_truncate_keeps_most_recent() {
        assert_eq!(truncate_for_display("abcdef", 3), "def");
        assert_eq!(truncate_for_display("abc", 10), "abc");
        assert_eq!(truncate_for_display("ééé", 2), "éé");
    }
}
