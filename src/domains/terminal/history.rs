use crate::shared::workspace_id::tab_dir;
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Upper bound on reconstructed scrollback, in bytes; the read truncates from
/// the front so the most recent output always survives.
pub const TAIL_READ_CAP: usize = 100_000;

// Raw NDJSON window scanned from the end of the file. Base64 plus the JSON
// wrapper inflate payloads by roughly a third, so twice the cap is enough to
// always fill it when the data exists.
const TAIL_WINDOW_BYTES: u64 = (TAIL_READ_CAP * 2) as u64;

const HISTORY_FILE: &str = "history.ndjson";
const META_FILE: &str = "meta.json";

/// One line of the append-only history file. Terminal output is stored as
/// base64 so non-UTF8 byte sequences survive the round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HistoryEntry {
    Data {
        data: String,
        ts: i64,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        ts: i64,
    },
}

/// Sidecar rewritten whole on each session start/stop. `byte_length` is the
/// NDJSON file's size, cumulative across sessions sharing the tab id, and is
/// the authoritative offset for current-session-only reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabMetadata {
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub exit_code: Option<i32>,
    pub byte_length: u64,
}

#[derive(Debug)]
pub struct HistoryReadResult {
    pub scrollback: Vec<u8>,
    pub was_recovered: bool,
    pub exit_code: Option<i32>,
    pub metadata: Option<TabMetadata>,
}

/// Filesystem-backed scrollback store, one directory per `(workspace, tab)`.
pub struct TerminalHistoryStore {
    root: PathBuf,
}

impl TerminalHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open (or create) the tab's history for a new session. Successive
    /// sessions on the same tab append to the same file.
    pub fn begin_session(
        &self,
        workspace_id: &str,
        tab_id: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalHistorySession> {
        let dir = tab_dir(&self.root, workspace_id, tab_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create history dir {}", dir.display()))?;

        let history_path = dir.join(HISTORY_FILE);
        let start_offset = match fs::metadata(&history_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history_path)
            .with_context(|| format!("Failed to open history file {}", history_path.display()))?;

        let meta = TabMetadata {
            cwd: cwd.display().to_string(),
            cols,
            rows,
            exit_code: None,
            byte_length: start_offset,
        };
        write_metadata(&dir, &meta)?;

        Ok(TerminalHistorySession {
            writer: Some(BufWriter::new(file)),
            dir,
            meta,
            start_offset,
        })
    }

    pub fn read_metadata(&self, workspace_id: &str, tab_id: &str) -> Result<Option<TabMetadata>> {
        read_metadata(&tab_dir(&self.root, workspace_id, tab_id))
    }

    pub fn read_history(&self, workspace_id: &str, tab_id: &str) -> Result<HistoryReadResult> {
        self.read_history_from(workspace_id, tab_id, 0)
    }

    /// Tail-optimized read starting at `byte_offset` (0 for the whole tab;
    /// the sidecar's `byte_length` for a current-session-only view). Lines
    /// before the window are skipped without parsing; malformed or partial
    /// trailing lines are dropped per-line, never failing the read.
    pub fn read_history_from(
        &self,
        workspace_id: &str,
        tab_id: &str,
        byte_offset: u64,
    ) -> Result<HistoryReadResult> {
        let dir = tab_dir(&self.root, workspace_id, tab_id);
        let metadata = read_metadata(&dir)?;
        let history_path = dir.join(HISTORY_FILE);

        let Ok(file_meta) = fs::metadata(&history_path) else {
            return Ok(HistoryReadResult {
                scrollback: Vec::new(),
                was_recovered: false,
                exit_code: metadata.as_ref().and_then(|m| m.exit_code),
                metadata,
            });
        };

        let file_len = file_meta.len();
        let mut start = byte_offset.min(file_len);
        let mut skip_first_line = false;
        if file_len.saturating_sub(start) > TAIL_WINDOW_BYTES {
            start = file_len - TAIL_WINDOW_BYTES;
            skip_first_line = true;
        }

        let mut file = File::open(&history_path)
            .with_context(|| format!("Failed to open {}", history_path.display()))?;
        file.seek(SeekFrom::Start(start))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let raw = String::from_utf8_lossy(&raw);

        let mut scrollback = Vec::new();
        let mut exit_code = None;
        let mut recovered = false;

        for (index, line) in raw.lines().enumerate() {
            if index == 0 && skip_first_line {
                // The seek almost certainly landed mid-line.
                continue;
            }
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(HistoryEntry::Data { data, .. }) => match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => {
                        recovered = true;
                        scrollback.extend_from_slice(&bytes);
                    }
                    Err(err) => debug!("Skipping undecodable history chunk: {err}"),
                },
                Ok(HistoryEntry::Exit { exit_code: code, .. }) => {
                    recovered = true;
                    exit_code = Some(code);
                }
                Err(err) => {
                    // Partial last line after a crash, or stray garbage.
                    debug!("Skipping malformed history line: {err}");
                }
            }
        }

        if scrollback.len() > TAIL_READ_CAP {
            scrollback.drain(..scrollback.len() - TAIL_READ_CAP);
        }

        Ok(HistoryReadResult {
            scrollback,
            was_recovered: recovered,
            exit_code: exit_code.or_else(|| metadata.as_ref().and_then(|m| m.exit_code)),
            metadata,
        })
    }
}

/// Open handle for one terminal session's writes. Strictly append-only;
/// `finalize` seals it and rewrites the sidecar.
pub struct TerminalHistorySession {
    writer: Option<BufWriter<File>>,
    dir: PathBuf,
    meta: TabMetadata,
    start_offset: u64,
}

impl TerminalHistorySession {
    /// Byte offset in the shared history file where this session began.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn append_data(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("History session already finalized"))?;
        let entry = HistoryEntry::Data {
            data: BASE64.encode(bytes),
            ts: chrono::Utc::now().timestamp_millis(),
        };
        write_line(writer, &entry)
    }

    /// Append the exit marker, flush everything, and rewrite the sidecar with
    /// the cumulative file size. Further appends fail loudly.
    pub fn finalize(&mut self, exit_code: i32) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| anyhow!("History session already finalized"))?;
        let entry = HistoryEntry::Exit {
            exit_code,
            ts: chrono::Utc::now().timestamp_millis(),
        };
        write_line(&mut writer, &entry)?;
        writer.flush().context("Failed to flush history file")?;
        drop(writer);

        let history_path = self.dir.join(HISTORY_FILE);
        let byte_length = fs::metadata(&history_path)
            .with_context(|| format!("Failed to stat {}", history_path.display()))?
            .len();

        self.meta.exit_code = Some(exit_code);
        self.meta.byte_length = byte_length;
        write_metadata(&self.dir, &self.meta)
    }
}

fn write_line(writer: &mut BufWriter<File>, entry: &HistoryEntry) -> Result<()> {
    serde_json::to_writer(&mut *writer, entry).context("Failed to encode history entry")?;
    writer
        .write_all(b"\n")
        .context("Failed to write history entry")?;
    writer.flush().context("Failed to flush history entry")?;
    Ok(())
}

fn write_metadata(dir: &Path, meta: &TabMetadata) -> Result<()> {
    let path = dir.join(META_FILE);
    let json = serde_json::to_string_pretty(meta)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn read_metadata(dir: &Path) -> Result<Option<TabMetadata>> {
    let path = dir.join(META_FILE);
    let Ok(raw) = fs::read_to_string(&path) else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) => {
            debug!("Ignoring unreadable metadata sidecar {}: {err}", path.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, TerminalHistoryStore) {
        let temp = TempDir::new().unwrap();
        let store = TerminalHistoryStore::new(temp.path());
        (temp, store)
    }

    #[test]
    fn append_and_recover_round_trip() {
        let (_temp, store) = store();
        let mut session = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();

        session.append_data(b"hello ").unwrap();
        session.append_data(&[0xff, 0xfe, 0x00]).unwrap();
        session.append_data(b"world").unwrap();
        session.finalize(0).unwrap();

        let result = store.read_history("ws1", "tab1").unwrap();
        assert!(result.was_recovered);
        assert_eq!(result.exit_code, Some(0));

        let mut expected = b"hello ".to_vec();
        expected.extend_from_slice(&[0xff, 0xfe, 0x00]);
        expected.extend_from_slice(b"world");
        assert_eq!(result.scrollback, expected);

        let meta = result.metadata.unwrap();
        assert_eq!(meta.exit_code, Some(0));
        assert_eq!(meta.cols, 80);
        assert_eq!(meta.rows, 24);
    }

    #[test]
    fn byte_length_accumulates_across_sessions() {
        let (_temp, store) = store();

        let mut first = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();
        assert_eq!(first.start_offset(), 0);
        first.append_data(b"first-session-marker").unwrap();
        first.finalize(0).unwrap();
        let first_len = store
            .read_metadata("ws1", "tab1")
            .unwrap()
            .unwrap()
            .byte_length;

        let mut second = store
            .begin_session("ws1", "tab1", Path::new("/work"), 120, 40)
            .unwrap();
        assert_eq!(second.start_offset(), first_len);
        second.append_data(b"second-session-marker").unwrap();
        second.finalize(1).unwrap();
        let second_len = store
            .read_metadata("ws1", "tab1")
            .unwrap()
            .unwrap()
            .byte_length;

        assert!(second_len > first_len);

        let all = store.read_history("ws1", "tab1").unwrap();
        let text = String::from_utf8(all.scrollback).unwrap();
        assert!(text.contains("first-session-marker"));
        assert!(text.contains("second-session-marker"));

        // Current-session-only view starts at the previous cumulative offset.
        let current = store.read_history_from("ws1", "tab1", first_len).unwrap();
        let text = String::from_utf8(current.scrollback).unwrap();
        assert!(!text.contains("first-session-marker"));
        assert!(text.contains("second-session-marker"));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let (temp, store) = store();
        let mut session = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();
        session.append_data(b"good-data").unwrap();
        session.finalize(0).unwrap();

        // Simulate a crash mid-write: raw garbage and a truncated JSON line.
        let history = temp.path().join("ws1/tab1/history.ndjson");
        let mut file = OpenOptions::new().append(true).open(&history).unwrap();
        file.write_all(b"this is not json\n").unwrap();
        file.write_all(b"{\"type\":\"data\",\"da").unwrap();

        let result = store.read_history("ws1", "tab1").unwrap();
        assert!(result.was_recovered);
        assert_eq!(result.scrollback, b"good-data");
    }

    #[test]
    fn tail_read_caps_from_the_front() {
        let (_temp, store) = store();
        let mut session = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();

        let chunk = vec![b'x'; 1000];
        for _ in 0..200 {
            session.append_data(&chunk).unwrap();
        }
        session.append_data(b"final-marker").unwrap();
        session.finalize(0).unwrap();

        let result = store.read_history("ws1", "tab1").unwrap();
        assert!(result.scrollback.len() <= TAIL_READ_CAP);
        let text = String::from_utf8(result.scrollback).unwrap();
        assert!(text.ends_with("final-marker"), "tail must be preserved");
    }

    #[test]
    fn append_after_finalize_fails_loudly() {
        let (_temp, store) = store();
        let mut session = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();
        session.finalize(0).unwrap();

        assert!(session.append_data(b"late").is_err());
        assert!(session.finalize(0).is_err());
    }

    #[test]
    fn reading_unknown_tab_reports_nothing_recovered() {
        let (_temp, store) = store();
        let result = store.read_history("ws1", "never-opened").unwrap();
        assert!(!result.was_recovered);
        assert!(result.scrollback.is_empty());
        assert!(result.metadata.is_none());
    }

    #[test]
    fn sidecar_rewritten_on_session_start() {
        let (_temp, store) = store();
        let mut session = store
            .begin_session("ws1", "tab1", Path::new("/work"), 80, 24)
            .unwrap();
        session.finalize(7).unwrap();

        // A new session resets the live geometry and clears the exit code.
        let _second = store
            .begin_session("ws1", "tab1", Path::new("/elsewhere"), 132, 50)
            .unwrap();
        let meta = store.read_metadata("ws1", "tab1").unwrap().unwrap();
        assert_eq!(meta.cwd, "/elsewhere");
        assert_eq!(meta.cols, 132);
        assert_eq!(meta.exit_code, None);
    }
}
