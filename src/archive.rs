//! Archive reader: `emails_YYYY[_NORMALIZED].txt` → ordered messages.
//!
//! Expected block layout (written by the upstream converter):
//!
//! ```text
//! === MESSAGE ===
//! 🗕 Date : 2023-04-02
//! 👤 From : Alice <alice@example.org>
//! 📨 To   : bob@example.org
//! 🧕 Subject : Re: weekend
//! ---
//! body lines…
//! === FIN ===
//! ```
//!
//! A block without a recognisable header is glued onto the previous
//! message's body. Only a headerless *first* block makes the file malformed.

use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Lines;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::AuditError;

const BLOCK_START: &str = "=== MESSAGE ===";
const BLOCK_END: &str = "=== FIN ===";
const HEADER_SEPARATOR: &str = "---";

// ── Regex patterns ─────────────────────────────────────────────────
//
// Real header lines:
//   🗕 Date : 2023-04-02
//   👤 From : Maryvonne <m@example.org>
//   📨 To   : y@example.org
//   Subject: Re: vacances
//
// The leading emoji is optional and may be mangled by re-encoding, so any
// single non-space token is accepted in front of the label.

static RE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\S+\s+)?(?P<label>(?i:date|from|to|subject))\s*:\s*(?P<value>.*?)\s*$")
        .unwrap()
});

static RE_ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^emails_(?P<year>\d{4})(?P<normalized>_NORMALIZED)?\.txt$").unwrap()
});

// ── Message ─────────────────────────────────────────────────────────

/// One parsed conversational turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// `{relation}-{year}-{position:05}`, stable for a given archive snapshot
    pub id: String,
    pub year: i32,
    /// 1-based position in file order
    pub position: usize,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub date_raw: String,
    pub timestamp: Option<NaiveDateTime>,
    pub body: String,
}

impl Message {
    pub fn body_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// RFC 3339-ish rendering of the timestamp, or the raw date text.
    pub fn timestamp_display(&self) -> String {
        match self.timestamp {
            Some(ts) => ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => self.date_raw.clone(),
        }
    }
}

pub fn message_id(relation: &str, year: i32, position: usize) -> String {
    format!("{relation}-{year}-{position:05}")
}

pub fn archive_file_name(year: i32, normalized: bool) -> String {
    if normalized {
        format!("emails_{year}_NORMALIZED.txt")
    } else {
        format!("emails_{year}.txt")
    }
}

// ── Discovery ───────────────────────────────────────────────────────

/// Years that have an archive file of the requested variant in `dir`,
/// ascending.
pub fn discover_years(dir: &Path, normalized: bool) -> Vec<i32> {
    let mut years: Vec<i32> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            let caps = RE_ARCHIVE_NAME.captures(&name)?;
            if caps.name("normalized").is_some() != normalized {
                return None;
            }
            caps.name("year")?.as_str().parse().ok()
        })
        .collect();
    years.sort_unstable();
    years.dedup();
    years
}

// ── Archive file ────────────────────────────────────────────────────

/// A validated archive file held in memory. Iterating it is lazy and can be
/// restarted any number of times.
#[derive(Debug)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub relation: String,
    pub year: i32,
    content: String,
}

impl ArchiveFile {
    pub fn open(dir: &Path, relation: &str, year: i32, normalized: bool) -> Result<Self, AuditError> {
        let path = dir.join(archive_file_name(year, normalized));
        if !path.is_file() {
            return Err(AuditError::SourceNotFound { path });
        }
        let content = fs::read_to_string(&path).map_err(|source| AuditError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_content(path, relation, year, content)
    }

    pub fn from_content(
        path: PathBuf,
        relation: &str,
        year: i32,
        content: String,
    ) -> Result<Self, AuditError> {
        if let Some(first) = Blocks::new(&content).next() {
            if parse_block(&first).is_none() {
                return Err(AuditError::MalformedArchive {
                    path,
                    reason: format!(
                        "first block has no Date/From header followed by a '{HEADER_SEPARATOR}' line"
                    ),
                });
            }
        }
        Ok(Self {
            path,
            relation: relation.to_string(),
            year,
            content,
        })
    }

    pub fn messages(&self) -> Messages<'_> {
        Messages {
            archive: self,
            blocks: Blocks::new(&self.content),
            pending: None,
            position: 0,
        }
    }
}

// ── Block splitting ─────────────────────────────────────────────────

/// Splits raw text into blocks of lines. Marker lines are consumed; text
/// outside markers forms blocks of its own.
struct Blocks<'a> {
    lines: Peekable<Lines<'a>>,
}

impl<'a> Blocks<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().peekable(),
        }
    }
}

fn is_blank(lines: &[&str]) -> bool {
    lines.iter().all(|l| l.trim().is_empty())
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Vec<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut block: Vec<&'a str> = Vec::new();
        let mut opened = false;

        while let Some(&line) = self.lines.peek() {
            let marker = line.trim();
            if marker == BLOCK_START {
                if opened || !is_blank(&block) {
                    // Leave the marker for the next call
                    return Some(block);
                }
                self.lines.next();
                block.clear();
                opened = true;
                continue;
            }
            self.lines.next();
            if marker == BLOCK_END {
                if opened || !is_blank(&block) {
                    return Some(block);
                }
                block.clear();
                continue;
            }
            block.push(line);
        }

        if opened || !is_blank(&block) {
            Some(block)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Header {
    date: String,
    from: String,
    to: String,
    subject: String,
}

/// Returns `None` when the block does not carry a message header.
fn parse_block(lines: &[&str]) -> Option<(Header, String)> {
    let sep = lines.iter().position(|l| l.trim() == HEADER_SEPARATOR)?;
    let mut header = Header::default();
    for line in &lines[..sep] {
        let Some(caps) = RE_FIELD.captures(line) else {
            continue;
        };
        let value = caps["value"].to_string();
        match caps["label"].to_ascii_lowercase().as_str() {
            "date" => header.date = value,
            "from" => header.from = value,
            "to" => header.to = value,
            "subject" => header.subject = value,
            _ => {}
        }
    }
    if header.date.is_empty() && header.from.is_empty() {
        return None;
    }
    Some((header, join_body(&lines[sep + 1..])))
}

fn join_body(lines: &[&str]) -> String {
    clean_body(lines.join("\n").trim())
}

/// Undo quoted-printable leftovers: soft line breaks and encoded spaces.
fn clean_body(raw: &str) -> String {
    raw.replace("=\n", "").replace("=20", " ")
}

/// Best-effort date parsing. Unparseable dates leave the timestamp empty.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%d/%m/%Y %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    DateTime::parse_from_rfc2822(raw).ok().map(|dt| dt.naive_local())
}

// ── Message iterator ────────────────────────────────────────────────

/// Lazy message sequence over one archive file, in file order.
pub struct Messages<'a> {
    archive: &'a ArchiveFile,
    blocks: Blocks<'a>,
    pending: Option<Message>,
    position: usize,
}

impl Messages<'_> {
    fn start_message(&mut self, header: Header, body: String) -> Message {
        self.position += 1;
        let timestamp = parse_timestamp(&header.date);
        Message {
            id: message_id(&self.archive.relation, self.archive.year, self.position),
            year: self.archive.year,
            position: self.position,
            sender: header.from,
            recipient: header.to,
            subject: header.subject,
            date_raw: header.date,
            timestamp,
            body,
        }
    }
}

impl Iterator for Messages<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while let Some(block) = self.blocks.next() {
            match parse_block(&block) {
                Some((header, body)) => {
                    let fresh = self.start_message(header, body);
                    if let Some(done) = self.pending.replace(fresh) {
                        return Some(done);
                    }
                }
                None => {
                    // Continuation of the previous message
                    let extra = join_body(&block);
                    if let Some(prev) = self.pending.as_mut() {
                        if !extra.is_empty() {
                            if !prev.body.is_empty() {
                                prev.body.push_str("\n\n");
                            }
                            prev.body.push_str(&extra);
                        }
                    }
                }
            }
        }
        self.pending.take()
    }
}
