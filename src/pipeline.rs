//! One audit run for one relation: archives → classifier → sink → report.

use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::archive::{ArchiveFile, Message};
use crate::classifier::ClassifierAdapter;
use crate::config::{OwnerConfig, Relation};
use crate::error::AuditError;
use crate::report::Report;
use crate::sink::EventSink;
use crate::taxonomy::Taxonomy;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub years: Vec<i32>,
    pub normalized: bool,
    /// Cap on classifier calls for the whole run; `None` is unbounded
    pub max: Option<usize>,
    pub throttle: Duration,
    /// Empty the rich view once every archive has been validated
    pub clear_events: bool,
    /// Empty the light view once every archive has been validated
    pub clear_light: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub years: Vec<i32>,
    pub messages: usize,
    /// Already settled in the sink
    pub skipped: usize,
    pub classified: usize,
    pub with_findings: usize,
    pub events: usize,
    /// Findings dropped by validation
    pub discarded: usize,
    /// Left for a later run because of `--max`
    pub deferred: usize,
    /// Ids of messages the classifier gave up on
    pub failed: Vec<String>,
    pub report: Option<PathBuf>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years: Vec<String> = self.years.iter().map(|y| y.to_string()).collect();
        writeln!(f, "Years:        {}", years.join(", "))?;
        writeln!(f, "Messages:     {}", self.messages)?;
        writeln!(f, "  skipped:    {}", self.skipped)?;
        writeln!(f, "  classified: {}", self.classified)?;
        writeln!(f, "  deferred:   {}", self.deferred)?;
        writeln!(f, "  failed:     {}", self.failed.len())?;
        writeln!(f, "With findings: {} ({} events, {} discarded)", self.with_findings, self.events, self.discarded)?;
        if !self.failed.is_empty() {
            writeln!(f, "Failed ids:   {}", self.failed.join(", "))?;
        }
        if let Some(path) = &self.report {
            writeln!(f, "Report:       {}", path.display())?;
        }
        Ok(())
    }
}

pub struct Pipeline<'a> {
    pub relation: &'a Relation,
    pub owner: &'a OwnerConfig,
    pub taxonomy: &'a Taxonomy,
    pub adapter: ClassifierAdapter<'a>,
    pub options: RunOptions,
}

impl Pipeline<'_> {
    /// Every selected archive is opened and validated before the first
    /// classifier call, so input errors never leave a partial run behind.
    fn load_archives(&self) -> Result<Vec<(i32, Vec<Message>)>, AuditError> {
        let archives = self
            .options
            .years
            .iter()
            .map(|&year| {
                ArchiveFile::open(
                    &self.relation.archives_dir,
                    &self.relation.id,
                    year,
                    self.options.normalized,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(archives
            .iter()
            .map(|a| {
                debug!(path = %a.path.display(), year = a.year, "archive opened");
                (a.year, a.messages().collect())
            })
            .collect())
    }

    pub fn run(&self, sink: &mut EventSink) -> Result<RunSummary, AuditError> {
        let archives = self.load_archives()?;
        if self.options.clear_events {
            sink.clear_events()?;
            info!(path = %sink.rich_path().display(), "rich view cleared");
        }
        if self.options.clear_light {
            sink.clear_light()?;
            info!(path = %sink.light_path().display(), "light view cleared");
        }

        let mut summary = RunSummary {
            years: self.options.years.clone(),
            ..RunSummary::default()
        };
        let mut calls = 0usize;

        for (year, messages) in &archives {
            info!(year, messages = messages.len(), "processing archive");
            summary.messages += messages.len();

            for (i, message) in messages.iter().enumerate() {
                if sink.has(&message.id, &message.body_hash()) {
                    debug!(message = %message.id, "already analysed");
                    summary.skipped += 1;
                    continue;
                }
                if self.options.max.is_some_and(|max| calls >= max) {
                    summary.deferred += 1;
                    continue;
                }
                if calls > 0 && !self.options.throttle.is_zero() {
                    thread::sleep(self.options.throttle);
                }
                calls += 1;

                let before = i.checked_sub(1).and_then(|j| messages.get(j));
                let after = messages.get(i + 1);
                match self.adapter.analyze(message, before, after) {
                    Ok(analysis) => {
                        let attribution = self.relation.attribute(self.owner, message);
                        sink.append(message, &analysis, &attribution)?;
                        summary.classified += 1;
                        summary.discarded += analysis.discarded;
                        if !analysis.events.is_empty() {
                            summary.with_findings += 1;
                            summary.events += analysis.events.len();
                        }
                        debug!(message = %message.id, events = analysis.events.len(), "message recorded");
                    }
                    Err(failure) => {
                        warn!(error = %failure, "message left unprocessed");
                        summary.failed.push(failure.message_id);
                    }
                }
            }
        }

        if summary.deferred > 0 {
            info!(deferred = summary.deferred, "classification cap reached; remaining messages deferred");
        }

        let all_messages: Vec<Message> = archives.into_iter().flat_map(|(_, m)| m).collect();
        let report = Report {
            relation_id: &self.relation.id,
            relation_name: &self.relation.name,
            years: &self.options.years,
            messages: &all_messages,
            sink: &*sink,
            taxonomy: self.taxonomy,
        };
        let path = report.write(&self.relation.html_dir)?;
        info!(path = %path.display(), "report written");
        summary.report = Some(path);
        Ok(summary)
    }
}
