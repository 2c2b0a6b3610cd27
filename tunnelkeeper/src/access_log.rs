//! Access-log ingestion: parsing the static server's log lines and tailing
//! the file as a restartable stream.
//!
//! The tailer owns an advancing byte offset that only ever moves past
//! complete lines, survives log rotation by watching the inode, and can be
//! checkpointed to the state store so a restart resumes with bounded loss.

use std::os::unix::fs::MetadataExt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};
use utils::id::TunnelId;

use crate::metrics::ACCESS_LOG_ROTATIONS;

/// One line of the static server's access log:
/// `$remote_addr - [$time_iso8601] "$method $uri" $status $bytes_sent
///  $body_bytes_sent "$http_user_agent" $request_time $request_id`
static LOG_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(\S+) - \[([^\]]+)\] "([A-Z]+) ([^" ]+)(?: HTTP/[0-9.]+)?" (\d{3}) (\d+) (\d+) "([^"]*)" ([0-9.]+) (\S+)$"#,
    )
    .expect("access log regex is valid")
});

static TUNNEL_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/(files|download-file)/([0-9a-f]{8})(?:/|$)").expect("path regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct AccessLogEvent {
    pub remote_addr: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub body_bytes_sent: u64,
    pub user_agent: String,
    pub request_time: f64,
    pub request_id: String,
}

#[derive(Debug, thiserror::Error)]
#[error("unparseable access log line")]
pub struct ParseError;

pub fn parse_line(line: &str) -> Result<AccessLogEvent, ParseError> {
    let caps = LOG_LINE_RE.captures(line.trim_end()).ok_or(ParseError)?;

    let timestamp = DateTime::parse_from_rfc3339(&caps[2])
        .map_err(|_| ParseError)?
        .with_timezone(&Utc);
    let uri = &caps[4];
    let path = uri.split('?').next().unwrap_or(uri).to_owned();

    Ok(AccessLogEvent {
        remote_addr: caps[1].to_owned(),
        timestamp,
        method: caps[3].to_owned(),
        path,
        status: caps[5].parse().map_err(|_| ParseError)?,
        bytes_sent: caps[6].parse().map_err(|_| ParseError)?,
        body_bytes_sent: caps[7].parse().map_err(|_| ParseError)?,
        user_agent: caps[8].to_owned(),
        request_time: caps[9].parse().map_err(|_| ParseError)?,
        request_id: caps[10].to_owned(),
    })
}

/// Which tunnel route a request path belongs to, if any. Courtesy-page hits
/// are attributed but never counted towards `bytes_served`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Courtesy,
    Download,
}

pub fn classify_path(path: &str) -> Option<(RouteKind, TunnelId)> {
    let caps = TUNNEL_PATH_RE.captures(path)?;
    let kind = match &caps[1] {
        "files" => RouteKind::Courtesy,
        _ => RouteKind::Download,
    };
    let id = caps[2].parse().ok()?;
    Some((kind, id))
}

/// Persisted tail position: the inode pins the identity of the file the
/// offset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub inode: u64,
    pub offset: u64,
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

impl FromStr for LogPosition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (inode, offset) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed log position '{s}'"))?;
        Ok(LogPosition {
            inode: inode.parse()?,
            offset: offset.parse()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Normal startup: only future events matter.
    End,
    /// Crash recovery: resume from the last persisted position.
    Checkpoint(LogPosition),
}

pub struct LogTailer {
    path: Utf8PathBuf,
    file: tokio::fs::File,
    inode: u64,
    /// Byte offset of the first unconsumed complete line.
    offset: u64,
    /// Partial trailing line carried between polls.
    pending: Vec<u8>,
}

impl LogTailer {
    pub async fn open(path: &Utf8Path, start: StartPosition) -> anyhow::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;
        let inode = meta.ino();
        let len = meta.len();

        let offset = match start {
            StartPosition::End => len,
            StartPosition::Checkpoint(pos) => {
                if pos.inode == inode && pos.offset <= len {
                    pos.offset
                } else {
                    // The file was rotated while we were down. Events in the
                    // rotated-away file are lost; re-read the current file
                    // from the start, over-counting is capped downstream.
                    info!("log checkpoint {pos} does not match inode {inode} (len {len}), re-reading current file");
                    0
                }
            }
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        Ok(Self {
            path: path.to_owned(),
            file,
            inode,
            offset,
            pending: Vec::new(),
        })
    }

    pub fn checkpoint(&self) -> LogPosition {
        LogPosition {
            inode: self.inode,
            offset: self.offset,
        }
    }

    /// Drain currently-available complete lines, up to `max_lines`.
    /// Returns an empty vec when caught up; the caller decides how long to
    /// sleep before polling again.
    pub async fn poll_lines(&mut self, max_lines: usize) -> anyhow::Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut buf = [0u8; 8192];

        while lines.len() < max_lines {
            self.drain_pending(&mut lines, max_lines);
            if lines.len() >= max_lines {
                break;
            }

            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                if self.reopen_if_rotated().await? {
                    continue;
                }
                break;
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
        self.drain_pending(&mut lines, max_lines);
        Ok(lines)
    }

    fn drain_pending(&mut self, lines: &mut Vec<String>, max_lines: usize) {
        while lines.len() < max_lines {
            let newline = match self.pending.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => return,
            };
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.offset += line.len() as u64;
            let text = String::from_utf8_lossy(&line[..newline]).into_owned();
            if !text.is_empty() {
                lines.push(text);
            }
        }
    }

    /// True if the log was rotated or truncated and we reopened it.
    async fn reopen_if_rotated(&mut self) -> anyhow::Result<bool> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            // Mid-rotation window; try again on the next poll.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let consumed = self.offset + self.pending.len() as u64;
        if meta.ino() == self.inode && meta.len() >= consumed {
            return Ok(false);
        }

        info!(
            "access log rotated (inode {} -> {}), reopening",
            self.inode,
            meta.ino()
        );
        ACCESS_LOG_ROTATIONS.inc();
        if !self.pending.is_empty() {
            warn!(
                "dropping {} bytes of partial line from rotated log",
                self.pending.len()
            );
            self.pending.clear();
        }
        self.file = tokio::fs::File::open(&self.path).await?;
        self.inode = meta.ino();
        self.offset = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const LINE_200: &str = r#"203.0.113.9 - [2026-03-01T10:00:00+00:00] "GET /download-file/0a1b2c3d/a.txt" 200 12288 12000 "curl/8.4.0" 0.512 f3a9c2d1"#;
    const LINE_206: &str = r#"203.0.113.9 - [2026-03-01T10:00:01+00:00] "GET /download-file/0a1b2c3d/a.txt?x=1" 206 5000 4800 "Mozilla/5.0" 0.100 ab12cd34"#;
    const LINE_COURTESY: &str = r#"198.51.100.7 - [2026-03-01T10:00:02+00:00] "GET /files/0a1b2c3d/a.txt" 200 900 640 "Mozilla/5.0" 0.004 99aa88bb"#;

    #[test]
    fn parse_download_line() {
        let event = parse_line(LINE_200).unwrap();
        assert_eq!(event.remote_addr, "203.0.113.9");
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/download-file/0a1b2c3d/a.txt");
        assert_eq!(event.status, 200);
        assert_eq!(event.bytes_sent, 12288);
        assert_eq!(event.body_bytes_sent, 12000);
        assert_eq!(event.request_id, "f3a9c2d1");
        assert_eq!(
            event.timestamp,
            DateTime::parse_from_rfc3339("2026-03-01T10:00:00+00:00").unwrap()
        );
    }

    #[test]
    fn parse_strips_query() {
        let event = parse_line(LINE_206).unwrap();
        assert_eq!(event.path, "/download-file/0a1b2c3d/a.txt");
        assert_eq!(event.status, 206);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_line("").is_err());
        assert!(parse_line("not a log line").is_err());
        assert!(parse_line(r#"1.2.3.4 - [garbage] "GET /x" 200 1 1 "ua" 0.1 id"#).is_err());
    }

    #[test]
    fn classify_routes() {
        assert_eq!(
            classify_path("/download-file/0a1b2c3d/a.txt"),
            Some((RouteKind::Download, "0a1b2c3d".parse().unwrap()))
        );
        assert_eq!(
            classify_path("/files/0a1b2c3d/a.txt"),
            Some((RouteKind::Courtesy, "0a1b2c3d".parse().unwrap()))
        );
        assert_eq!(classify_path("/metrics"), None);
        assert_eq!(classify_path("/files/xyz/a.txt"), None);
        assert_eq!(classify_path("/files/0A1B2C3D/a.txt"), None);
    }

    #[test]
    fn log_position_roundtrip() {
        let pos = LogPosition {
            inode: 42,
            offset: 1234,
        };
        assert_eq!(pos.to_string().parse::<LogPosition>().unwrap(), pos);
        assert!("junk".parse::<LogPosition>().is_err());
    }

    #[tokio::test]
    async fn tail_from_end_sees_only_new_lines() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        tokio::fs::write(&path, format!("{LINE_200}\n")).await.unwrap();

        let mut tailer = LogTailer::open(&path, StartPosition::End).await.unwrap();
        assert!(tailer.poll_lines(100).await.unwrap().is_empty());

        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        f.write_all(format!("{LINE_206}\n").as_bytes()).await.unwrap();
        f.flush().await.unwrap();

        let lines = tailer.poll_lines(100).await.unwrap();
        assert_eq!(lines, vec![LINE_206.to_string()]);
    }

    #[tokio::test]
    async fn tail_holds_partial_lines() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let mut tailer = LogTailer::open(&path, StartPosition::End).await.unwrap();
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        let (head, tail) = LINE_200.split_at(40);
        f.write_all(head.as_bytes()).await.unwrap();
        f.flush().await.unwrap();

        assert!(tailer.poll_lines(100).await.unwrap().is_empty());
        let before = tailer.checkpoint();

        f.write_all(format!("{tail}\n").as_bytes()).await.unwrap();
        f.flush().await.unwrap();
        let lines = tailer.poll_lines(100).await.unwrap();
        assert_eq!(lines, vec![LINE_200.to_string()]);
        // Offset only advances over complete lines.
        assert!(tailer.checkpoint().offset > before.offset);
        assert_eq!(before.offset, 0);
    }

    #[tokio::test]
    async fn tail_follows_rotation() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        tokio::fs::write(&path, format!("{LINE_200}\n")).await.unwrap();

        let mut tailer = LogTailer::open(&path, StartPosition::End).await.unwrap();

        tokio::fs::rename(&path, dir.path().join("access.log.1"))
            .await
            .unwrap();
        tokio::fs::write(&path, format!("{LINE_COURTESY}\n"))
            .await
            .unwrap();

        let lines = tailer.poll_lines(100).await.unwrap();
        assert_eq!(lines, vec![LINE_COURTESY.to_string()]);
    }

    #[tokio::test]
    async fn checkpoint_resume() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        tokio::fs::write(&path, format!("{LINE_200}\n")).await.unwrap();

        let mut tailer = LogTailer::open(&path, StartPosition::End).await.unwrap();
        let checkpoint = tailer.checkpoint();
        drop(tailer);

        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        f.write_all(format!("{LINE_206}\n").as_bytes()).await.unwrap();
        f.flush().await.unwrap();

        let mut resumed = LogTailer::open(&path, StartPosition::Checkpoint(checkpoint))
            .await
            .unwrap();
        let lines = resumed.poll_lines(100).await.unwrap();
        assert_eq!(lines, vec![LINE_206.to_string()]);
    }

    #[tokio::test]
    async fn stale_checkpoint_rereads_current_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        tokio::fs::write(&path, format!("{LINE_200}\n")).await.unwrap();

        let tailer = LogTailer::open(&path, StartPosition::End).await.unwrap();
        let stale = LogPosition {
            inode: tailer.checkpoint().inode + 1,
            offset: 3,
        };
        drop(tailer);

        let mut resumed = LogTailer::open(&path, StartPosition::Checkpoint(stale))
            .await
            .unwrap();
        let lines = resumed.poll_lines(100).await.unwrap();
        assert_eq!(lines, vec![LINE_200.to_string()]);
    }
}
