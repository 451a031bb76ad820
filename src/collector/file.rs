//! File collector: backward-chunked snapshots and a polling follower.
//!
//! The follower reopens the file on every poll, which makes external
//! rotation, truncation and replacement look the same as ordinary growth
//! or shrinkage. The read offset is the only state carried across polls.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    send_event, sleep_or_stop, Backoff, CollectorError, CollectorTiming, Lifecycle, SendOutcome,
    SNAPSHOT_LINES,
};
use crate::event::{LogEvent, SourceKind, StreamKind};
use crate::timestamp::{split_line_timestamp, trim_line_ending};

/// Chunk size for backward snapshot reads.
const SNAPSHOT_CHUNK_SIZE: usize = 8 * 1024;

/// Marker for "no snapshot taken yet" in the resume offset.
const NO_RESUME_OFFSET: u64 = u64::MAX;

/// Collects events from a local file that is being appended to.
pub struct FileCollector {
    path: PathBuf,
    name: String,
    timing: CollectorTiming,
    lifecycle: Lifecycle,
    /// Offset just past the last complete line of the last snapshot
    resume_offset: Arc<AtomicU64>,
}

impl FileCollector {
    /// Bind a collector to `path`, failing if the file cannot be opened now.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CollectorError> {
        Self::with_timing(path, CollectorTiming::default())
    }

    /// Like [`FileCollector::new`] with explicit poll and reconnect timing.
    pub fn with_timing(
        path: impl Into<PathBuf>,
        timing: CollectorTiming,
    ) -> Result<Self, CollectorError> {
        let path = path.into();
        let name = path.display().to_string();

        std::fs::File::open(&path).map_err(|source| CollectorError::SourceUnreadable {
            path: name.clone(),
            source,
        })?;

        Ok(Self {
            path,
            name,
            timing,
            lifecycle: Lifecycle::default(),
            resume_offset: Arc::new(AtomicU64::new(NO_RESUME_OFFSET)),
        })
    }

    /// Read the last [`SNAPSHOT_LINES`] lines without loading the whole file.
    pub async fn snapshot(&self) -> Result<Vec<LogEvent>, CollectorError> {
        let path = self.path.clone();
        let tail = tokio::task::spawn_blocking(move || {
            read_tail_lines(&path, SNAPSHOT_CHUNK_SIZE, SNAPSHOT_LINES)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|result| result)
        .map_err(|source| CollectorError::SourceUnreadable {
            path: self.name.clone(),
            source,
        })?;

        self.resume_offset.store(tail.end_offset, Ordering::SeqCst);
        debug!(
            path = %self.name,
            lines = tail.lines.len(),
            end_offset = tail.end_offset,
            "File snapshot taken"
        );

        Ok(tail
            .lines
            .iter()
            .map(|raw| {
                let text = String::from_utf8_lossy(raw);
                let (timestamp, message) = split_line_timestamp(trim_line_ending(&text));
                LogEvent::from_file_line(message, timestamp)
            })
            .collect())
    }

    /// Spawn the follow task.
    ///
    /// Following begins where the last snapshot ended, or at the current end
    /// of file when no snapshot was taken.
    pub fn start(&self, tx: mpsc::Sender<LogEvent>) -> Result<JoinHandle<()>, CollectorError> {
        let stop = self.lifecycle.claim_start()?;
        let resume = self.resume_offset.load(Ordering::SeqCst);

        let follower = FileFollower {
            path: self.path.clone(),
            name: self.name.clone(),
            timing: self.timing,
            stop,
            tx,
            position: (resume != NO_RESUME_OFFSET).then_some(resume),
        };

        info!(path = %self.name, "Following file");
        Ok(tokio::spawn(follower.run()))
    }

    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    pub fn source_name(&self) -> &str {
        &self.name
    }
}

/// Lines recovered from the end of a file.
#[derive(Debug)]
pub(crate) struct TailLines {
    /// Raw lines without terminators, oldest first
    pub(crate) lines: Vec<Vec<u8>>,
    /// Offset just past the final `\n`, where following resumes
    pub(crate) end_offset: u64,
}

/// Collect up to `max_lines` trailing lines by reading `chunk_size` blocks
/// backward from the end of the file.
///
/// `pending` holds the leftmost, possibly incomplete line seen so far; bytes
/// from the next chunk to the left are prepended to it until a newline
/// proves it complete. Bytes after the final `\n` are left out.
pub(crate) fn read_tail_lines(
    path: &Path,
    chunk_size: usize,
    max_lines: usize,
) -> std::io::Result<TailLines> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok(TailLines {
            lines: Vec::new(),
            end_offset: 0,
        });
    }

    let chunk_size = chunk_size.max(1) as u64;
    let mut buf = vec![0u8; chunk_size.min(size) as usize];

    // An unterminated tail is still being written; the follower picks it up
    // from `end_offset` once its newline lands.
    let Some(end) = last_newline(&mut file, size, &mut buf)? else {
        return Ok(TailLines {
            lines: Vec::new(),
            end_offset: 0,
        });
    };
    let end_offset = end + 1;
    if max_lines == 0 {
        return Ok(TailLines {
            lines: Vec::new(),
            end_offset,
        });
    }

    let mut lines: VecDeque<Vec<u8>> = VecDeque::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut pos = end;

    while pos > 0 && lines.len() < max_lines {
        let len = chunk_size.min(pos);
        pos -= len;

        let chunk = &mut buf[..len as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(chunk)?;

        let mut segments = chunk.rsplit(|&b| b == b'\n');
        if let Some(rightmost) = segments.next() {
            pending.splice(0..0, rightmost.iter().copied());
        }
        for segment in segments {
            lines.push_front(std::mem::replace(&mut pending, segment.to_vec()));
        }
    }

    if pos == 0 {
        lines.push_front(pending);
    }
    while lines.len() > max_lines {
        lines.pop_front();
    }

    Ok(TailLines {
        lines: lines.into(),
        end_offset,
    })
}

/// Offset of the last `\n` in the first `size` bytes, scanning backward one
/// `buf`-sized block at a time.
fn last_newline(
    file: &mut std::fs::File,
    size: u64,
    buf: &mut [u8],
) -> std::io::Result<Option<u64>> {
    let mut pos = size;
    while pos > 0 {
        let len = (buf.len() as u64).min(pos);
        pos -= len;

        let chunk = &mut buf[..len as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(chunk)?;
        if let Some(index) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(Some(pos + index as u64));
        }
    }
    Ok(None)
}

struct FileFollower {
    path: PathBuf,
    name: String,
    timing: CollectorTiming,
    stop: CancellationToken,
    tx: mpsc::Sender<LogEvent>,
    /// Offset of the next unread byte; `None` until the first successful open
    position: Option<u64>,
}

impl FileFollower {
    async fn run(mut self) {
        let mut backoff = Backoff::from_timing(&self.timing);
        let mut missing = false;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let mut file = match File::open(&self.path).await {
                Ok(file) => file,
                Err(e) => {
                    if !missing {
                        missing = true;
                        self.position = Some(0);
                        warn!(path = %self.name, error = %e, "File disappeared, waiting");
                        let notice = format!("File '{}' not found. Waiting for file...", self.name);
                        if !self.notify(StreamKind::Stderr, notice).await {
                            break;
                        }
                    }
                    if !sleep_or_stop(backoff.current(), &self.stop).await {
                        break;
                    }
                    backoff.advance();
                    continue;
                }
            };

            if missing {
                missing = false;
                backoff.reset();
                info!(path = %self.name, "File found again, resuming");
                let notice = format!("File '{}' found. Resuming log streaming...", self.name);
                if !self.notify(StreamKind::Stdout, notice).await {
                    break;
                }
            }

            let size = match file.metadata().await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(path = %self.name, error = %e, "Failed to stat file");
                    drop(file);
                    if !sleep_or_stop(backoff.current(), &self.stop).await {
                        break;
                    }
                    backoff.advance();
                    continue;
                }
            };

            let mut position = *self.position.get_or_insert(size);

            if size < position {
                info!(path = %self.name, size, position, "File shrank, assuming rotation");
                position = 0;
                self.position = Some(0);
                let notice = "File rotation detected. Restarting from beginning...";
                if !self.notify(StreamKind::Stdout, notice).await {
                    break;
                }
            }

            if size > position {
                match self.read_new_lines(&mut file, position, size).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(path = %self.name, error = %e, "Failed to read appended lines"),
                }
            }

            drop(file);
            if !sleep_or_stop(self.timing.poll_interval, &self.stop).await {
                break;
            }
        }

        debug!(path = %self.name, "File follower stopped");
    }

    /// Emit every complete line between `start` and `end`, advancing the
    /// position per line. An unterminated tail is left for a later poll.
    /// Returns `false` once the follower should exit.
    async fn read_new_lines(
        &mut self,
        file: &mut File,
        start: u64,
        end: u64,
    ) -> std::io::Result<bool> {
        file.seek(SeekFrom::Start(start)).await?;
        let mut reader = BufReader::new(file.take(end - start));
        let mut raw = Vec::new();
        let mut offset = start;

        loop {
            raw.clear();
            let read = reader.read_until(b'\n', &mut raw).await?;
            if read == 0 || raw.last() != Some(&b'\n') {
                return Ok(true);
            }
            offset += read as u64;

            let text = String::from_utf8_lossy(&raw);
            let (timestamp, message) = split_line_timestamp(trim_line_ending(&text));
            let event = LogEvent::from_file_line(message, timestamp);

            if send_event(&self.tx, event, &self.stop).await != SendOutcome::Delivered {
                return Ok(false);
            }
            self.position = Some(offset);
        }
    }

    async fn notify(&self, stream: StreamKind, text: impl AsRef<str>) -> bool {
        let event = LogEvent::notice(SourceKind::File, stream, text);
        send_event(&self.tx, event, &self.stop).await == SendOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::time::timeout;

    fn fast_timing() -> CollectorTiming {
        CollectorTiming {
            poll_interval: Duration::from_millis(10),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(80),
        }
    }

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    /// Reference answer: split on `\n`, drop the empty piece after a final newline.
    fn expected_tail(content: &str, max: usize) -> Vec<String> {
        let mut lines: Vec<&str> = content.split('\n').collect();
        if content.ends_with('\n') {
            lines.pop();
        }
        let skip = lines.len().saturating_sub(max);
        lines[skip..].iter().map(|s| s.to_string()).collect()
    }

    fn tail_as_strings(path: &Path, chunk_size: usize) -> Vec<String> {
        read_tail_lines(path, chunk_size, SNAPSHOT_LINES)
            .unwrap()
            .lines
            .into_iter()
            .map(|l| String::from_utf8(l).unwrap())
            .collect()
    }

    async fn next_event(rx: &mut mpsc::Receiver<LogEvent>) -> LogEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    #[test]
    fn test_snapshot_returns_last_hundred_lines() {
        let content: String = (0..250).map(|i| format!("line {}\n", i)).collect();
        let file = write_file(&content);

        let lines = tail_as_strings(file.path(), SNAPSHOT_CHUNK_SIZE);
        assert_eq!(lines.len(), 100);
        assert_eq!(lines.first().unwrap(), "line 150");
        assert_eq!(lines.last().unwrap(), "line 249");
    }

    #[test]
    fn test_snapshot_short_file_returns_everything() {
        let file = write_file("a\nb\nc\n");
        assert_eq!(tail_as_strings(file.path(), SNAPSHOT_CHUNK_SIZE), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_without_trailing_newline() {
        let content = "a\nb\nunterminated";
        let file = write_file(content);
        for chunk_size in [1, 4, 5, 64] {
            let tail = read_tail_lines(file.path(), chunk_size, SNAPSHOT_LINES).unwrap();
            assert_eq!(tail.lines, vec![b"a".to_vec(), b"b".to_vec()], "chunk size {}", chunk_size);
            assert_eq!(tail.end_offset, 4);
        }

        let no_newline = write_file("partial");
        let tail = read_tail_lines(no_newline.path(), 3, SNAPSHOT_LINES).unwrap();
        assert!(tail.lines.is_empty());
        assert_eq!(tail.end_offset, 0);
    }

    #[tokio::test]
    async fn test_unterminated_line_is_delivered_whole_after_snapshot() {
        let file = write_file("first\npart");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();

        let snapshot = collector.snapshot().await.unwrap();
        let messages: Vec<&str> = snapshot.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first"]);

        let (tx, mut rx) = mpsc::channel(16);
        let handle = collector.start(tx).unwrap();

        append(file.path(), "ial\n");
        assert_eq!(next_event(&mut rx).await.message, "partial");

        collector.stop();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_waits_for_line_terminator() {
        let file = write_file("");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = collector.start(tx).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        append(file.path(), "half");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        append(file.path(), " done\nnext\n");
        assert_eq!(next_event(&mut rx).await.message, "half done");
        assert_eq!(next_event(&mut rx).await.message, "next");

        collector.stop();
    }

    #[test]
    fn test_snapshot_keeps_empty_lines() {
        let file = write_file("\n\nx\n\ny\n");
        assert_eq!(tail_as_strings(file.path(), 2), vec!["", "", "x", "", "y"]);

        let only_newline = write_file("\n");
        assert_eq!(tail_as_strings(only_newline.path(), 8), vec![""]);
    }

    #[test]
    fn test_snapshot_empty_file() {
        let file = write_file("");
        let tail = read_tail_lines(file.path(), SNAPSHOT_CHUNK_SIZE, SNAPSHOT_LINES).unwrap();
        assert!(tail.lines.is_empty());
        assert_eq!(tail.end_offset, 0);
    }

    #[test]
    fn test_snapshot_chunk_size_invariance() {
        let mut content = String::new();
        for i in 0..180 {
            let width = (i * 37) % 91;
            content.push_str(&format!("{:04} {}\n", i, "x".repeat(width)));
            if i % 17 == 0 {
                content.push('\n');
            }
        }

        let file = write_file(&content);
        let expected = expected_tail(&content, SNAPSHOT_LINES);
        assert_eq!(expected.len(), SNAPSHOT_LINES);

        for chunk_size in [1, 2, 3, 5, 8, 13, 64, 95, 96, 97, 1000, 8192, 1 << 20] {
            assert_eq!(
                tail_as_strings(file.path(), chunk_size),
                expected,
                "chunk size {}",
                chunk_size
            );
        }
    }

    #[test]
    fn test_line_split_on_chunk_boundary() {
        // With chunk size 6 the boundary falls inside "middle".
        let content = "first\nmiddle\nlast\n";
        let file = write_file(content);
        for chunk_size in 1..=content.len() + 1 {
            assert_eq!(
                tail_as_strings(file.path(), chunk_size),
                vec!["first", "middle", "last"],
                "chunk size {}",
                chunk_size
            );
        }
    }

    #[tokio::test]
    async fn test_snapshot_parses_timestamps() {
        let file = write_file("2024-01-01T00:00:00Z hello\n2024-01-01T00:00:01Z world\n");
        let collector = FileCollector::new(file.path()).unwrap();

        let events = collector.snapshot().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(events[1].timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap());
        assert_eq!(events[0].message, "hello");
        assert_eq!(events[1].message, "world");
        assert!(events.iter().all(|e| e.source == SourceKind::File));
    }

    #[test]
    fn test_new_rejects_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = FileCollector::new(dir.path().join("absent.log"));
        assert!(matches!(result, Err(CollectorError::SourceUnreadable { .. })));
    }

    #[tokio::test]
    async fn test_follow_emits_appended_lines_after_snapshot() {
        let file = write_file("old line\n");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();
        collector.snapshot().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let handle = collector.start(tx).unwrap();

        append(file.path(), "2024-05-05 10:00:00 first\nsecond\n");
        let first = next_event(&mut rx).await;
        let second = next_event(&mut rx).await;
        assert_eq!(first.message, "first");
        assert_eq!(first.timestamp, Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap());
        assert_eq!(second.message, "second");

        collector.stop();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let file = write_file("");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let _handle = collector.start(tx.clone()).unwrap();
        assert!(matches!(collector.start(tx), Err(CollectorError::AlreadyStarted)));
        collector.stop();
    }

    #[tokio::test]
    async fn test_truncation_emits_rotation_and_restarts() {
        let file = write_file("");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = collector.start(tx).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        append(file.path(), "a fairly long line before rotation\n");
        assert_eq!(next_event(&mut rx).await.message, "a fairly long line before rotation");

        std::fs::write(file.path(), "x\n").unwrap();
        let notice = next_event(&mut rx).await;
        assert!(notice.is_notice());
        assert!(notice.message.contains("rotation detected"));
        assert_eq!(next_event(&mut rx).await.message, "x");

        collector.stop();
    }

    #[tokio::test]
    async fn test_deletion_emits_single_notice_then_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let collector = FileCollector::with_timing(&path, fast_timing()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = collector.start(tx).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::remove_file(&path).unwrap();
        let missing = next_event(&mut rx).await;
        assert!(missing.message.contains("not found"));
        assert_eq!(missing.stream, StreamKind::Stderr);

        // Several backoff cycles pass while the file is absent.
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::fs::write(&path, "back\n").unwrap();

        let found = next_event(&mut rx).await;
        assert!(found.message.contains("found. Resuming"), "got {:?}", found.message);
        assert_eq!(next_event(&mut rx).await.message, "back");

        collector.stop();
    }

    #[tokio::test]
    async fn test_stop_unblocks_full_channel() {
        let file = write_file("");
        let collector = FileCollector::with_timing(file.path(), fast_timing()).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let handle = collector.start(tx).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        append(file.path(), &"line\n".repeat(50));
        tokio::time::sleep(Duration::from_millis(50)).await;

        collector.stop();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("follower must exit while blocked on send")
            .unwrap();
    }
}
