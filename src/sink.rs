//! Event sink: the only durable state of the engine.
//!
//! Two CSV views back it:
//!   - rich: one row per detection event
//!   - light: one row per processed message (also for clean messages)
//!
//! The light row is written after the message's rich rows and acts as the
//! commit marker: a message counts as processed only when its light row
//! exists, carries the current body hash, and agrees with the rich rows.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sophism_types::{LightRow, RichRow, Severity};
use thiserror::Error;

use crate::archive::Message;
use crate::classifier::Analysis;

pub const RICH_COLUMNS: [&str; 15] = [
    "message_id",
    "year",
    "sender",
    "speaker",
    "timestamp",
    "theme",
    "body_hash",
    "sophism_key",
    "label",
    "severity",
    "confidence",
    "excerpt",
    "note",
    "truncated_at",
    "recorded_at",
];

pub const LIGHT_COLUMNS: [&str; 11] = [
    "message_id",
    "year",
    "sender",
    "speaker",
    "timestamp",
    "body_hash",
    "event_count",
    "max_severity",
    "top_finding",
    "truncated_at",
    "processed_at",
];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("event for message {event_message} cannot be stored under {message_id}")]
    ForeignEvent {
        message_id: String,
        event_message: String,
    },

    #[error("excerpt is not part of the body of {message_id}: {excerpt:?}")]
    ExcerptNotInBody { message_id: String, excerpt: String },
}

/// Who spoke and what the message is about, derived from relation config.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub speaker: String,
    pub theme: String,
}

// ── Light summary projection ────────────────────────────────────────

/// What a light row states about its message's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub event_count: usize,
    pub max_severity: Option<Severity>,
    pub top_finding: Option<String>,
}

impl Summary {
    fn of_light(row: &LightRow) -> Self {
        Self {
            event_count: row.event_count,
            max_severity: row.max_severity,
            top_finding: row.top_finding.clone(),
        }
    }
}

/// Aggregate rich rows into the light summary. The top finding is the first
/// row carrying the highest severity.
pub fn summarize<'a>(rows: impl IntoIterator<Item = &'a RichRow>) -> Summary {
    let mut summary = Summary {
        event_count: 0,
        max_severity: None,
        top_finding: None,
    };
    for row in rows {
        summary.event_count += 1;
        if summary.max_severity.is_none_or(|max| row.severity > max) {
            summary.max_severity = Some(row.severity);
            summary.top_finding = Some(row.sophism_key.clone());
        }
    }
    summary
}

/// A light row that does not match its rich rows, or rich rows without a
/// light row.
#[derive(Debug, Clone, PartialEq)]
pub struct Inconsistency {
    pub message_id: String,
    pub derived: Summary,
    pub recorded: Option<Summary>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RederiveReport {
    pub kept: usize,
    pub rebuilt: usize,
    pub dropped: usize,
}

// ── Sink ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct EventSink {
    rich_path: PathBuf,
    light_path: PathBuf,
    rich: Vec<RichRow>,
    light: Vec<LightRow>,
    rich_index: HashMap<String, Vec<usize>>,
    light_index: HashMap<String, usize>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
    move |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> SinkError + '_ {
    move |source| SinkError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, SinkError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(csv_err(path))?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(csv_err(path))
}

/// Serialize rows, optionally preceded by the header line.
fn encode_rows<T: Serialize>(
    path: &Path,
    columns: &[&str],
    rows: &[T],
    with_header: bool,
) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(columns).map_err(csv_err(path))?;
    }
    for row in rows {
        writer.serialize(row).map_err(csv_err(path))?;
    }
    writer
        .into_inner()
        .map_err(|e| SinkError::Io {
            path: path.to_path_buf(),
            source: e.into_error(),
        })
}

/// Append records in a single write so a message's rows land together.
fn append_rows<T: Serialize>(path: &Path, columns: &[&str], rows: &[T]) -> Result<(), SinkError> {
    if rows.is_empty() {
        return Ok(());
    }
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let bytes = encode_rows(path, columns, rows, needs_header)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(&bytes).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))
}

/// Replace the whole file through a temp file and a rename.
fn rewrite_rows<T: Serialize>(path: &Path, columns: &[&str], rows: &[T]) -> Result<(), SinkError> {
    let bytes = encode_rows(path, columns, rows, true)?;
    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, &bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

impl EventSink {
    pub fn open(rich_path: &Path, light_path: &Path) -> Result<Self, SinkError> {
        for path in [rich_path, light_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let mut sink = Self {
            rich_path: rich_path.to_path_buf(),
            light_path: light_path.to_path_buf(),
            rich: read_rows(rich_path)?,
            light: read_rows(light_path)?,
            rich_index: HashMap::new(),
            light_index: HashMap::new(),
        };
        sink.reindex();
        Ok(sink)
    }

    fn reindex(&mut self) {
        self.rich_index.clear();
        for (i, row) in self.rich.iter().enumerate() {
            self.rich_index.entry(row.message_id.clone()).or_default().push(i);
        }
        // Last light row wins if a file was edited by hand
        self.light_index = self
            .light
            .iter()
            .enumerate()
            .map(|(i, row)| (row.message_id.clone(), i))
            .collect();
    }

    pub fn rich_path(&self) -> &Path {
        &self.rich_path
    }

    pub fn light_path(&self) -> &Path {
        &self.light_path
    }

    pub fn rich_rows(&self) -> &[RichRow] {
        &self.rich
    }

    pub fn light_rows(&self) -> &[LightRow] {
        &self.light
    }

    pub fn events_for(&self, message_id: &str) -> Vec<&RichRow> {
        self.rich_index
            .get(message_id)
            .map(|idx| idx.iter().map(|&i| &self.rich[i]).collect())
            .unwrap_or_default()
    }

    pub fn light_row(&self, message_id: &str) -> Option<&LightRow> {
        self.light_index.get(message_id).map(|&i| &self.light[i])
    }

    fn is_consistent(&self, light: &LightRow) -> bool {
        let rows = self.events_for(&light.message_id);
        rows.iter().all(|r| r.body_hash == light.body_hash) && summarize(rows) == Summary::of_light(light)
    }

    /// Whether a complete result set exists for this message and body.
    pub fn has(&self, message_id: &str, body_hash: &str) -> bool {
        self.light_row(message_id)
            .is_some_and(|light| light.body_hash == body_hash && self.is_consistent(light))
    }

    /// Store the result set of one message, replacing any earlier one.
    /// Zero events still record the message as processed.
    pub fn append(
        &mut self,
        message: &Message,
        analysis: &Analysis,
        attribution: &Attribution,
    ) -> Result<(), SinkError> {
        for event in &analysis.events {
            if event.message_id != message.id {
                return Err(SinkError::ForeignEvent {
                    message_id: message.id.clone(),
                    event_message: event.message_id.clone(),
                });
            }
            if event.excerpt.is_empty() || !message.body.contains(&event.excerpt) {
                return Err(SinkError::ExcerptNotInBody {
                    message_id: message.id.clone(),
                    excerpt: event.excerpt.clone(),
                });
            }
        }

        let now = now_rfc3339();
        let body_hash = message.body_hash();
        let timestamp = message.timestamp_display();
        let rich_rows: Vec<RichRow> = analysis
            .events
            .iter()
            .map(|event| RichRow {
                message_id: message.id.clone(),
                year: message.year,
                sender: message.sender.clone(),
                speaker: attribution.speaker.clone(),
                timestamp: timestamp.clone(),
                theme: attribution.theme.clone(),
                body_hash: body_hash.clone(),
                sophism_key: event.sophism_key.clone(),
                label: event.label.clone(),
                severity: event.severity,
                confidence: event.confidence,
                excerpt: event.excerpt.clone(),
                note: event.note.clone(),
                truncated_at: analysis.truncated_at,
                recorded_at: now.clone(),
            })
            .collect();
        let summary = summarize(&rich_rows);
        let light_row = LightRow {
            message_id: message.id.clone(),
            year: message.year,
            sender: message.sender.clone(),
            speaker: attribution.speaker.clone(),
            timestamp,
            body_hash,
            event_count: summary.event_count,
            max_severity: summary.max_severity,
            top_finding: summary.top_finding,
            truncated_at: analysis.truncated_at,
            processed_at: now,
        };

        let replacing =
            self.rich_index.contains_key(&message.id) || self.light_index.contains_key(&message.id);
        if replacing {
            self.rich.retain(|r| r.message_id != message.id);
            self.light.retain(|r| r.message_id != message.id);
            self.rich.extend(rich_rows);
            self.light.push(light_row);
            rewrite_rows(&self.rich_path, &RICH_COLUMNS, &self.rich)?;
            rewrite_rows(&self.light_path, &LIGHT_COLUMNS, &self.light)?;
        } else {
            append_rows(&self.rich_path, &RICH_COLUMNS, &rich_rows)?;
            append_rows(&self.light_path, &LIGHT_COLUMNS, std::slice::from_ref(&light_row))?;
            self.rich.extend(rich_rows);
            self.light.push(light_row);
        }
        self.reindex();
        Ok(())
    }

    /// Truncate the rich view. The light view is left untouched.
    pub fn clear_events(&mut self) -> Result<(), SinkError> {
        self.rich.clear();
        rewrite_rows::<RichRow>(&self.rich_path, &RICH_COLUMNS, &[])?;
        self.reindex();
        Ok(())
    }

    /// Truncate the light view. The rich view is left untouched.
    pub fn clear_light(&mut self) -> Result<(), SinkError> {
        self.light.clear();
        rewrite_rows::<LightRow>(&self.light_path, &LIGHT_COLUMNS, &[])?;
        self.reindex();
        Ok(())
    }

    /// Re-derive every light summary from the rich view and report the
    /// messages where the two disagree.
    pub fn verify(&self) -> Vec<Inconsistency> {
        let mut out = Vec::new();
        for light in &self.light {
            if !self.is_consistent(light) {
                out.push(Inconsistency {
                    message_id: light.message_id.clone(),
                    derived: summarize(self.events_for(&light.message_id)),
                    recorded: Some(Summary::of_light(light)),
                });
            }
        }
        for id in self.rich_ids_in_order() {
            if !self.light_index.contains_key(id) {
                out.push(Inconsistency {
                    message_id: id.to_string(),
                    derived: summarize(self.events_for(id)),
                    recorded: None,
                });
            }
        }
        out
    }

    fn rich_ids_in_order(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.rich
            .iter()
            .map(|r| r.message_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Rebuild the light view from the rich view. Consistent rows are kept,
    /// rows contradicted by the rich view are rebuilt from it when it holds
    /// events for the message and dropped otherwise (the message becomes
    /// pending again).
    pub fn rederive_light(&mut self) -> Result<RederiveReport, SinkError> {
        let mut report = RederiveReport::default();
        let mut rebuilt: Vec<LightRow> = Vec::new();
        let mut covered: HashSet<String> = HashSet::new();

        for light in &self.light {
            if self.is_consistent(light) {
                report.kept += 1;
                rebuilt.push(light.clone());
                covered.insert(light.message_id.clone());
            }
        }
        for id in self.rich_ids_in_order() {
            if covered.contains(id) {
                continue;
            }
            let rows = self.events_for(id);
            let first = rows[0];
            let summary = summarize(rows.iter().copied());
            rebuilt.push(LightRow {
                message_id: id.to_string(),
                year: first.year,
                sender: first.sender.clone(),
                speaker: first.speaker.clone(),
                timestamp: first.timestamp.clone(),
                body_hash: first.body_hash.clone(),
                event_count: summary.event_count,
                max_severity: summary.max_severity,
                top_finding: summary.top_finding,
                truncated_at: first.truncated_at,
                processed_at: first.recorded_at.clone(),
            });
            covered.insert(id.to_string());
            report.rebuilt += 1;
        }
        report.dropped = self
            .light
            .iter()
            .filter(|l| !self.is_consistent(l) && !self.rich_index.contains_key(&l.message_id))
            .count();

        self.light = rebuilt;
        rewrite_rows(&self.light_path, &LIGHT_COLUMNS, &self.light)?;
        self.reindex();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DetectionEvent;

    fn message(id: &str, body: &str) -> Message {
        Message {
            id: id.to_string(),
            year: 2023,
            position: 1,
            sender: "a@example.org".to_string(),
            recipient: String::new(),
            subject: String::new(),
            date_raw: "2023-01-01".to_string(),
            timestamp: None,
            body: body.to_string(),
        }
    }

    fn event(msg: &Message, key: &str, excerpt: &str, severity: Severity) -> DetectionEvent {
        DetectionEvent {
            message_id: msg.id.clone(),
            sophism_key: key.to_string(),
            label: key.to_string(),
            excerpt: excerpt.to_string(),
            severity,
            confidence: 0.8,
            note: "note".to_string(),
        }
    }

    fn analysis(events: Vec<DetectionEvent>) -> Analysis {
        Analysis {
            events,
            truncated_at: None,
            discarded: 0,
        }
    }

    fn open(dir: &Path) -> EventSink {
        EventSink::open(&dir.join("rich.csv"), &dir.join("light.csv")).unwrap()
    }

    #[test]
    fn test_append_then_has() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "tu me fais de la peine");
        assert!(!sink.has(&m.id, &m.body_hash()));
        let a = analysis(vec![event(&m, "guilt_tripping", "de la peine", Severity::High)]);
        sink.append(&m, &a, &Attribution::default()).unwrap();
        assert!(sink.has(&m.id, &m.body_hash()));
        assert_eq!(sink.rich_rows().len(), 1);
        assert_eq!(sink.light_rows().len(), 1);
    }

    #[test]
    fn test_interrupted_append_is_not_committed() {
        let m = message("r-2023-00001", "c'est de ta faute, tu me fais de la peine");
        let a = analysis(vec![
            event(&m, "guilt_tripping", "c'est de ta faute", Severity::High),
            event(&m, "guilt_tripping", "tu me fais de la peine", Severity::Medium),
        ]);

        // Rich rows reached the disk, the light row never did
        let scratch = tempfile::tempdir().unwrap();
        open(scratch.path()).append(&m, &a, &Attribution::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::copy(scratch.path().join("rich.csv"), dir.path().join("rich.csv")).unwrap();

        let mut sink = open(dir.path());
        assert_eq!(sink.rich_rows().len(), 2);
        assert!(sink.light_row(&m.id).is_none());
        assert!(!sink.has(&m.id, &m.body_hash()));

        let issues = sink.verify();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message_id, m.id);
        assert!(issues[0].recorded.is_none());
        assert_eq!(issues[0].derived.event_count, 2);

        sink.append(&m, &a, &Attribution::default()).unwrap();
        assert!(sink.has(&m.id, &m.body_hash()));
        assert!(sink.verify().is_empty());

        let sink = open(dir.path());
        assert_eq!(sink.rich_rows().len(), 2);
        assert_eq!(sink.light_rows().len(), 1);
        assert_eq!(sink.light_row(&m.id).unwrap().event_count, 2);
    }

    #[test]
    fn test_zero_events_marks_processed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "bonjour");
        sink.append(&m, &analysis(vec![]), &Attribution::default()).unwrap();
        assert!(sink.has(&m.id, &m.body_hash()));
        assert_eq!(sink.rich_rows().len(), 0);
        let light = sink.light_row(&m.id).unwrap();
        assert_eq!(light.event_count, 0);
        assert_eq!(light.max_severity, None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let m = message("r-2023-00001", "c'est de ta faute, comme d'habitude");
        {
            let mut sink = open(dir.path());
            let a = analysis(vec![
                event(&m, "guilt_tripping", "c'est de ta faute", Severity::Medium),
                event(&m, "vague_grievances", "comme d'habitude", Severity::High),
            ]);
            let attribution = Attribution {
                speaker: "Maryvonne".to_string(),
                theme: "Argent".to_string(),
            };
            sink.append(&m, &a, &attribution).unwrap();
        }
        let sink = open(dir.path());
        assert!(sink.has(&m.id, &m.body_hash()));
        let light = sink.light_row(&m.id).unwrap();
        assert_eq!(light.event_count, 2);
        assert_eq!(light.max_severity, Some(Severity::High));
        assert_eq!(light.top_finding.as_deref(), Some("vague_grievances"));
        assert_eq!(sink.rich_rows()[0].speaker, "Maryvonne");
        assert_eq!(sink.rich_rows()[0].theme, "Argent");
        assert!(sink.verify().is_empty());
    }

    #[test]
    fn test_changed_body_replaces_result_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let old = message("r-2023-00001", "première version, c'est de ta faute");
        sink.append(
            &old,
            &analysis(vec![event(&old, "guilt_tripping", "c'est de ta faute", Severity::High)]),
            &Attribution::default(),
        )
        .unwrap();

        let new = message("r-2023-00001", "seconde version sans reproche");
        assert!(!sink.has(&new.id, &new.body_hash()));
        sink.append(&new, &analysis(vec![]), &Attribution::default()).unwrap();
        assert!(sink.has(&new.id, &new.body_hash()));
        assert_eq!(sink.rich_rows().len(), 0);
        assert_eq!(sink.light_rows().len(), 1);

        let reopened = open(dir.path());
        assert_eq!(reopened.rich_rows().len(), 0);
        assert_eq!(reopened.light_rows().len(), 1);
    }

    #[test]
    fn test_rejects_excerpt_not_in_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "bonjour");
        let a = analysis(vec![event(&m, "straw_man", "au revoir", Severity::Low)]);
        assert!(matches!(
            sink.append(&m, &a, &Attribution::default()),
            Err(SinkError::ExcerptNotInBody { .. })
        ));
        assert!(!sink.has(&m.id, &m.body_hash()));
        assert!(sink.rich_rows().is_empty());
    }

    #[test]
    fn test_rejects_foreign_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "bonjour");
        let other = message("r-2023-00002", "bonjour");
        let a = analysis(vec![event(&other, "straw_man", "bonjour", Severity::Low)]);
        assert!(matches!(
            sink.append(&m, &a, &Attribution::default()),
            Err(SinkError::ForeignEvent { .. })
        ));
    }

    #[test]
    fn test_clear_light_keeps_rich() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "tu ne fais jamais rien");
        sink.append(
            &m,
            &analysis(vec![event(&m, "vague_grievances", "jamais", Severity::Low)]),
            &Attribution::default(),
        )
        .unwrap();
        sink.clear_light().unwrap();
        assert_eq!(sink.light_rows().len(), 0);
        assert_eq!(sink.rich_rows().len(), 1);
        assert!(!sink.has(&m.id, &m.body_hash()));

        let reopened = open(dir.path());
        assert_eq!(reopened.light_rows().len(), 0);
        assert_eq!(reopened.rich_rows().len(), 1);
    }

    #[test]
    fn test_clear_events_keeps_light() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let clean = message("r-2023-00001", "bonjour");
        let dirty = message("r-2023-00002", "tu ne fais jamais rien");
        sink.append(&clean, &analysis(vec![]), &Attribution::default()).unwrap();
        sink.append(
            &dirty,
            &analysis(vec![event(&dirty, "vague_grievances", "jamais", Severity::Low)]),
            &Attribution::default(),
        )
        .unwrap();
        sink.clear_events().unwrap();
        assert_eq!(sink.rich_rows().len(), 0);
        assert_eq!(sink.light_rows().len(), 2);
        // The clean message is still settled; the other one needs a rerun
        assert!(sink.has(&clean.id, &clean.body_hash()));
        assert!(!sink.has(&dirty.id, &dirty.body_hash()));

        // Reclassifying replaces the stale light row instead of duplicating it
        sink.append(
            &dirty,
            &analysis(vec![event(&dirty, "vague_grievances", "jamais", Severity::Low)]),
            &Attribution::default(),
        )
        .unwrap();
        assert_eq!(sink.light_rows().len(), 2);
        assert_eq!(sink.rich_rows().len(), 1);
        assert!(sink.verify().is_empty());
    }

    #[test]
    fn test_verify_and_rederive_after_clear_light() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "après tout ce que j'ai fait pour toi");
        sink.append(
            &m,
            &analysis(vec![
                event(&m, "guilt_tripping", "après tout ce que j'ai fait", Severity::High),
                event(&m, "guilt_tripping", "pour toi", Severity::Low),
            ]),
            &Attribution::default(),
        )
        .unwrap();
        let before = sink.light_row(&m.id).unwrap().clone();
        sink.clear_light().unwrap();

        let issues = sink.verify();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].recorded, None);
        assert_eq!(issues[0].derived.event_count, 2);

        let report = sink.rederive_light().unwrap();
        assert_eq!(report.rebuilt, 1);
        assert!(sink.verify().is_empty());
        let after = sink.light_row(&m.id).unwrap();
        assert_eq!(after.event_count, before.event_count);
        assert_eq!(after.max_severity, before.max_severity);
        assert_eq!(after.top_finding, before.top_finding);
        assert!(sink.has(&m.id, &m.body_hash()));
    }

    #[test]
    fn test_rederive_drops_light_rows_without_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "tu ne fais jamais rien");
        sink.append(
            &m,
            &analysis(vec![event(&m, "vague_grievances", "jamais", Severity::Low)]),
            &Attribution::default(),
        )
        .unwrap();
        sink.clear_events().unwrap();
        assert_eq!(sink.verify().len(), 1);
        let report = sink.rederive_light().unwrap();
        assert_eq!(report.kept, 0);
        assert_eq!(report.dropped, 1);
        assert!(sink.light_rows().is_empty());
    }

    #[test]
    fn test_summarize_picks_first_most_severe() {
        let m = message("r-2023-00001", "a b c");
        let rows: Vec<RichRow> = [("x", Severity::Medium), ("y", Severity::High), ("z", Severity::High)]
            .iter()
            .map(|(key, sev)| RichRow {
                message_id: m.id.clone(),
                year: 2023,
                sender: String::new(),
                speaker: String::new(),
                timestamp: String::new(),
                theme: String::new(),
                body_hash: m.body_hash(),
                sophism_key: key.to_string(),
                label: key.to_string(),
                severity: *sev,
                confidence: 0.5,
                excerpt: "a".to_string(),
                note: String::new(),
                truncated_at: None,
                recorded_at: String::new(),
            })
            .collect();
        let s = summarize(&rows);
        assert_eq!(s.event_count, 3);
        assert_eq!(s.max_severity, Some(Severity::High));
        assert_eq!(s.top_finding.as_deref(), Some("y"));
        assert_eq!(summarize(std::iter::empty()).event_count, 0);
    }

    #[test]
    fn test_column_constants_match_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open(dir.path());
        let m = message("r-2023-00001", "comme d'habitude");
        sink.append(
            &m,
            &analysis(vec![event(&m, "vague_grievances", "comme d'habitude", Severity::Medium)]),
            &Attribution::default(),
        )
        .unwrap();
        let rich = fs::read_to_string(dir.path().join("rich.csv")).unwrap();
        let light = fs::read_to_string(dir.path().join("light.csv")).unwrap();
        assert_eq!(rich.lines().next().unwrap(), RICH_COLUMNS.join(","));
        assert_eq!(light.lines().next().unwrap(), LIGHT_COLUMNS.join(","));
    }

    #[test]
    fn test_multiline_excerpt_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = message("r-2023-00001", "ligne un, \"citée\"\nligne deux");
        {
            let mut sink = open(dir.path());
            sink.append(
                &m,
                &analysis(vec![event(&m, "double_talk", "\"citée\"\nligne", Severity::Low)]),
                &Attribution::default(),
            )
            .unwrap();
        }
        let sink = open(dir.path());
        assert_eq!(sink.rich_rows()[0].excerpt, "\"citée\"\nligne");
        assert!(sink.has(&m.id, &m.body_hash()));
    }
}
