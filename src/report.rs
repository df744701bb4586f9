//! HTML report: messages with their excerpts highlighted in place.
//!
//! Rendering is a pure projection of the sink contents and the parsed
//! messages; the only side effect is [`Report::write`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sophism_types::{HIDDEN_TOPIC_KEY, RichRow};

use crate::archive::Message;
use crate::error::AuditError;
use crate::sink::EventSink;
use crate::taxonomy::Taxonomy;

const UNCATEGORIZED: &str = "Autre";

const STYLE: &str = r#"<style>
body { font-family: system-ui, -apple-system, Segoe UI, Roboto, Arial, sans-serif; margin: 24px; color: #222; }
h1 { font-size: 24px; margin: 0 0 6px; }
.summary { padding: 12px 14px; background: #f5f7ff; border: 1px solid #e3e8ff; border-radius: 10px; margin-bottom: 20px; }
.grid { display: grid; grid-template-columns: repeat(5, 1fr); gap: 10px; }
.kpi { background: #fff; border: 1px solid #eee; border-radius: 10px; padding: 10px; }
.kpi .n { font-weight: 700; font-size: 20px; }
.msg { display: grid; grid-template-columns: 1fr 320px; border: 1px solid #eee; border-radius: 12px; margin: 18px 0; overflow: hidden; }
.msg header { grid-column: 1 / -1; background: #fafafa; border-bottom: 1px solid #eee; padding: 10px 12px; font-size: 13px; color: #444; }
.msg .body { padding: 14px 12px; line-height: 1.5; white-space: pre-wrap; }
.msg aside { border-left: 1px dashed #e5e5e5; padding: 10px 12px; background: #fffef6; font-size: 13px; }
.hl { border-radius: 2px; padding: 0 2px; }
.hl-low { background: #fff8b3; }
.hl-medium { background: #ffd27f; }
.hl-high { background: #ff9c8a; }
.hl-hidden { outline: 2px dotted #6a5acd; }
.badge { display: inline-block; padding: 2px 8px; border-radius: 999px; font-size: 12px; background: #eef; border: 1px solid #dde; margin-left: 6px; }
.badge.pending { background: #eee; color: #666; }
.badge.truncated { background: #fde; border-color: #fbc; }
.muted { color: #777; }
</style>"#;

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// `{relation}_sophisms_{first}[-{last}].html`
pub fn report_file_name(relation_id: &str, years: &[i32]) -> String {
    match (years.first(), years.last()) {
        (Some(first), Some(last)) if first != last => {
            format!("{relation_id}_sophisms_{first}-{last}.html")
        }
        (Some(first), _) => format!("{relation_id}_sophisms_{first}.html"),
        _ => format!("{relation_id}_sophisms.html"),
    }
}

// ── Spans ───────────────────────────────────────────────────────────

/// A highlighted byte range of a body and the event (1-based note number)
/// it belongs to.
#[derive(Debug, Clone, PartialEq)]
struct Span<'a> {
    start: usize,
    end: usize,
    note: usize,
    row: &'a RichRow,
}

/// First occurrence of each excerpt. An excerpt overlapping an earlier
/// span is not highlighted (it still gets its note).
fn compute_spans<'a>(body: &str, rows: &[&'a RichRow]) -> Vec<Span<'a>> {
    let mut spans: Vec<Span<'a>> = Vec::new();
    for (i, &row) in rows.iter().enumerate() {
        if row.excerpt.is_empty() {
            continue;
        }
        let Some(start) = body.find(&row.excerpt) else {
            continue;
        };
        let end = start + row.excerpt.len();
        if spans.iter().any(|s| start < s.end && s.start < end) {
            continue;
        }
        spans.push(Span {
            start,
            end,
            note: i + 1,
            row,
        });
    }
    spans.sort_by_key(|s| s.start);
    spans
}

fn mark_class(row: &RichRow) -> String {
    let mut class = format!("hl hl-{}", row.severity.as_str());
    if row.sophism_key == HIDDEN_TOPIC_KEY {
        class.push_str(" hl-hidden");
    }
    class
}

fn highlight(body: &str, spans: &[Span<'_>]) -> String {
    let mut out = String::with_capacity(body.len() + spans.len() * 64);
    let mut cursor = 0;
    for span in spans {
        out.push_str(&html_escape(&body[cursor..span.start]));
        out.push_str(&format!(
            r#"<mark class="{}" title="{}" data-note="{}">{}</mark>"#,
            mark_class(span.row),
            html_escape(&span.row.label),
            span.note,
            html_escape(&body[span.start..span.end]),
        ));
        cursor = span.end;
    }
    out.push_str(&html_escape(&body[cursor..]));
    out
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportStats {
    pub messages: usize,
    pub analysed: usize,
    pub pending: usize,
    pub with_findings: usize,
    pub events: usize,
    /// label → event count
    pub by_label: BTreeMap<String, usize>,
    /// taxonomy category → event count; entries without one count as "Autre"
    pub by_category: BTreeMap<String, usize>,
}

pub struct Report<'a> {
    pub relation_id: &'a str,
    pub relation_name: &'a str,
    pub years: &'a [i32],
    pub messages: &'a [Message],
    pub sink: &'a EventSink,
    pub taxonomy: &'a Taxonomy,
}

impl Report<'_> {
    pub fn file_name(&self) -> String {
        report_file_name(self.relation_id, self.years)
    }

    /// Rows for a message whose current body has a complete result set.
    fn settled_rows(&self, message: &Message) -> Option<Vec<&RichRow>> {
        self.sink
            .has(&message.id, &message.body_hash())
            .then(|| self.sink.events_for(&message.id))
    }

    fn category_of(&self, row: &RichRow) -> Option<&str> {
        self.taxonomy
            .get(&row.sophism_key)
            .and_then(|e| e.category.as_deref())
    }

    pub fn stats(&self) -> ReportStats {
        let mut stats = ReportStats {
            messages: self.messages.len(),
            ..ReportStats::default()
        };
        for message in self.messages {
            match self.settled_rows(message) {
                Some(rows) => {
                    stats.analysed += 1;
                    if !rows.is_empty() {
                        stats.with_findings += 1;
                    }
                    stats.events += rows.len();
                    for row in rows {
                        *stats.by_label.entry(row.label.clone()).or_default() += 1;
                        let category = self.category_of(row).unwrap_or(UNCATEGORIZED);
                        *stats.by_category.entry(category.to_string()).or_default() += 1;
                    }
                }
                None => stats.pending += 1,
            }
        }
        stats
    }

    pub fn render(&self) -> String {
        let stats = self.stats();
        let mut html = String::new();
        html.push_str("<!doctype html>\n<html lang=\"fr\">\n<head>\n<meta charset=\"utf-8\" />\n");
        html.push_str(&format!(
            "<title>Sophismes · {}</title>\n{STYLE}\n</head>\n<body>\n",
            html_escape(self.relation_name)
        ));
        html.push_str(&format!(
            "<h1>Analyse des sophismes · {} · {}</h1>\n",
            html_escape(self.relation_name),
            year_label(self.years)
        ));
        html.push_str(&format!(
            "<div class=\"muted\">Taxonomie : {} ({} entrées)</div>\n",
            html_escape(self.taxonomy.source()),
            self.taxonomy.len()
        ));
        self.render_summary(&mut html, &stats);

        for message in self.messages {
            self.render_message(&mut html, message);
        }
        html.push_str("</body>\n</html>\n");
        html
    }

    fn render_summary(&self, html: &mut String, stats: &ReportStats) {
        html.push_str("<section class=\"summary\">\n<div class=\"grid\">\n");
        for (n, label) in [
            (stats.messages, "Messages"),
            (stats.analysed, "Analysés"),
            (stats.pending, "En attente"),
            (stats.with_findings, "Avec sophismes"),
            (stats.events, "Sophismes détectés"),
        ] {
            html.push_str(&format!(
                "<div class=\"kpi\"><div class=\"n\">{n}</div><div class=\"muted\">{label}</div></div>\n"
            ));
        }
        html.push_str("</div>\n");

        for (class, title, counts) in [
            ("by-category", "Par catégorie", &stats.by_category),
            ("by-label", "Par sophisme", &stats.by_label),
        ] {
            if counts.is_empty() {
                continue;
            }
            let mut sorted: Vec<(&String, &usize)> = counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            html.push_str(&format!("<h3>{title}</h3>\n<ul class=\"{class}\">\n"));
            for (name, n) in sorted {
                html.push_str(&format!("<li>{}: {n}</li>\n", html_escape(name)));
            }
            html.push_str("</ul>\n");
        }
        html.push_str("</section>\n");
    }

    fn render_message(&self, html: &mut String, message: &Message) {
        let settled = self.settled_rows(message);
        let light = settled.as_ref().and_then(|_| self.sink.light_row(&message.id));

        html.push_str(&format!(
            "<article class=\"msg\" id=\"{}\">\n<header>",
            html_escape(&message.id)
        ));
        html.push_str(&format!(
            "<b>{}</b> · {} → {} · {}",
            html_escape(&message.timestamp_display()),
            html_escape(&message.sender),
            html_escape(&message.recipient),
            html_escape(&message.subject),
        ));
        if let Some(row) = light {
            if !row.speaker.is_empty() {
                html.push_str(&format!(" · <i>{}</i>", html_escape(&row.speaker)));
            }
            if let Some(cut) = row.truncated_at {
                html.push_str(&format!(
                    "<span class=\"badge truncated\">analyse limitée aux {cut} premiers caractères</span>"
                ));
            }
        }
        if settled.is_none() {
            html.push_str("<span class=\"badge pending\">en attente d'analyse</span>");
        }
        html.push_str("</header>\n");

        let pending = settled.is_none();
        let rows = settled.unwrap_or_default();
        let spans = compute_spans(&message.body, &rows);
        html.push_str("<div class=\"body\">");
        html.push_str(&highlight(&message.body, &spans));
        html.push_str("</div>\n<aside>");
        if pending {
            html.push_str("<span class=\"muted\">Message pas encore analysé.</span>");
        } else if rows.is_empty() {
            html.push_str("<span class=\"muted\">Aucun sophisme relevé.</span>");
        } else {
            html.push_str("<ol>\n");
            for row in &rows {
                let category = self
                    .category_of(row)
                    .map(|c| format!(" <span class=\"muted\">({})</span>", html_escape(c)))
                    .unwrap_or_default();
                html.push_str(&format!(
                    "<li class=\"{}\"><b>{}</b>{category} · {} · {:.2}<br>{}</li>\n",
                    mark_class(row),
                    html_escape(&row.label),
                    row.severity.as_str(),
                    row.confidence,
                    html_escape(&row.note),
                ));
            }
            html.push_str("</ol>");
        }
        html.push_str("</aside>\n</article>\n");
    }

    /// Render into `dir` and return the written path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, AuditError> {
        fs::create_dir_all(dir).map_err(|source| AuditError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(self.file_name());
        fs::write(&path, self.render()).map_err(|source| AuditError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

fn year_label(years: &[i32]) -> String {
    match (years.first(), years.last()) {
        (Some(a), Some(b)) if a != b => format!("{a}-{b}"),
        (Some(a), _) => a.to_string(),
        _ => String::new(),
    }
}
