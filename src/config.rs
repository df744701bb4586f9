//! Relation configuration: who the owner is, which relations exist, where
//! their archives and reports live, and how the classifier is reached.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::archive::Message;
use crate::classifier::{AdapterSettings, LlmSettings};
use crate::error::AuditError;
use crate::sink::Attribution;

pub const CONFIG_ENV: &str = "SOPHISM_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/sophism.yaml";
pub const DEFAULT_RELATION_ID: &str = "relation";
pub const RICH_CSV_NAME: &str = "sophismes_topics_master.csv";
pub const LIGHT_CSV_NAME: &str = "sophismes_topics_master_light.csv";
pub const HTML_DIR_NAME: &str = "sophismes";
const UNKNOWN_SPEAKER: &str = "Autre";
const DEFAULT_THEME: &str = "General";

// ── File schema ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub owner: OwnerConfig,
    pub llm: LlmConfig,
    pub relations: Vec<RelationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    pub name: String,
    pub emails: Vec<String>,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            name: "Moi".to_string(),
            emails: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    /// Seconds to wait between two classifier calls
    pub sleep_between_requests: f64,
    pub max_body_chars: usize,
    pub max_attempts: usize,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            sleep_between_requests: 0.25,
            max_body_chars: crate::classifier::DEFAULT_MAX_BODY_CHARS,
            max_attempts: crate::classifier::DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: crate::classifier::DEFAULT_RETRY_BACKOFF_MS,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            max_body_chars: self.max_body_chars.max(1),
            max_attempts: self.max_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_between_requests.max(0.0))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelationConfig {
    pub id: String,
    pub name: Option<String>,
    pub emails: Vec<String>,
    pub context_history: String,
    /// theme label → keywords
    pub theme_keywords: BTreeMap<String, Vec<String>>,
    pub archives_dir: Option<PathBuf>,
    pub reports: ReportPaths,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportPaths {
    pub html_dir: Option<PathBuf>,
    pub csv_light: Option<PathBuf>,
    pub csv_events: Option<PathBuf>,
}

// ── Resolved relation ───────────────────────────────────────────────

/// A relation with every path made absolute-or-cwd-relative and every
/// default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: String,
    pub name: String,
    pub emails: Vec<String>,
    pub context_history: String,
    pub theme_keywords: BTreeMap<String, Vec<String>>,
    pub archives_dir: PathBuf,
    pub html_dir: PathBuf,
    pub csv_events: PathBuf,
    pub csv_light: PathBuf,
}

impl Relation {
    /// A bare relation rooted at `archives_dir`, with default output paths.
    pub fn synthesized(id: &str, archives_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            emails: Vec::new(),
            context_history: String::new(),
            theme_keywords: BTreeMap::new(),
            archives_dir: archives_dir.to_path_buf(),
            html_dir: archives_dir.join(HTML_DIR_NAME),
            csv_events: archives_dir.join(RICH_CSV_NAME),
            csv_light: archives_dir.join(LIGHT_CSV_NAME),
        }
    }

    /// `archives_override` replaces the configured archive directory; report
    /// paths not set explicitly follow it.
    fn from_config(rel: &RelationConfig, base: &Path, archives_override: Option<&Path>) -> Self {
        let archives_dir = match (archives_override, rel.archives_dir.as_deref()) {
            (Some(dir), _) => dir.to_path_buf(),
            (None, Some(p)) => base.join(p),
            (None, None) => base.join("relations").join(&rel.id).join("txt"),
        };
        let mut relation = Self::synthesized(&rel.id, &archives_dir);
        relation.name = rel.name.clone().unwrap_or_else(|| rel.id.clone());
        relation.emails = rel.emails.clone();
        relation.context_history = rel.context_history.clone();
        relation.theme_keywords = rel.theme_keywords.clone();
        if let Some(p) = &rel.reports.html_dir {
            relation.html_dir = base.join(p);
        }
        if let Some(p) = &rel.reports.csv_events {
            relation.csv_events = base.join(p);
        }
        if let Some(p) = &rel.reports.csv_light {
            relation.csv_light = base.join(p);
        }
        relation
    }

    /// Speaker and theme columns for one message.
    pub fn attribute(&self, owner: &OwnerConfig, message: &Message) -> Attribution {
        Attribution {
            speaker: detect_speaker(&message.sender, owner, self),
            theme: guess_theme(&message.body, &self.theme_keywords),
        }
    }
}

/// Relation addresses win over owner addresses; anything else is "Autre".
pub fn detect_speaker(from: &str, owner: &OwnerConfig, relation: &Relation) -> String {
    let from = from.to_lowercase();
    let hit = |emails: &[String]| {
        emails
            .iter()
            .any(|e| !e.trim().is_empty() && from.contains(&e.trim().to_lowercase()))
    };
    if hit(&relation.emails) {
        relation.name.clone()
    } else if hit(&owner.emails) {
        owner.name.clone()
    } else {
        UNKNOWN_SPEAKER.to_string()
    }
}

/// The theme whose keywords occur most often in `text`. Ties keep the
/// alphabetically first theme.
pub fn guess_theme(text: &str, keywords: &BTreeMap<String, Vec<String>>) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut best: Option<(&str, usize)> = None;
    for (label, terms) in keywords {
        let hits = terms
            .iter()
            .filter(|t| !t.trim().is_empty() && normalized.contains(&t.to_lowercase()))
            .count();
        if hits > 0 && best.is_none_or(|(_, b)| hits > b) {
            best = Some((label.as_str(), hits));
        }
    }
    best.map(|(l, _)| l.to_string())
        .unwrap_or_else(|| DEFAULT_THEME.to_string())
}

// ── Loading ─────────────────────────────────────────────────────────

/// The config file to use: explicit path, then `SOPHISM_CONFIG`, then
/// `config/sophism.yaml` when it exists.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(CONFIG_ENV) {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
    fallback.is_file().then_some(fallback)
}

/// A parsed config and the directory its relative paths resolve against.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub base: PathBuf,
    pub config: AuditConfig,
}

impl LoadedConfig {
    pub fn load(path: &Path) -> Result<Self, AuditError> {
        let text = fs::read_to_string(path).map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_yaml(path, base, &text)
    }

    pub fn from_yaml(path: &Path, base: PathBuf, text: &str) -> Result<Self, AuditError> {
        let invalid = |reason: String| AuditError::Config {
            path: path.to_path_buf(),
            reason,
        };
        let config: AuditConfig = serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let mut seen = Vec::new();
        for rel in &config.relations {
            let id = rel.id.trim();
            if id.is_empty() {
                return Err(invalid("relation with an empty id".to_string()));
            }
            if seen.iter().any(|s: &String| s.eq_ignore_ascii_case(id)) {
                return Err(invalid(format!("relation '{id}' is defined twice")));
            }
            seen.push(id.to_string());
        }
        if config.llm.temperature.is_nan() || !(0.0..=2.0).contains(&config.llm.temperature) {
            return Err(invalid(format!(
                "llm.temperature {} is outside 0..=2",
                config.llm.temperature
            )));
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            base,
            config,
        })
    }

    /// Pick the relation to audit. `base_dir` overrides the archive
    /// directory and, when no configured relation matches, synthesises one.
    pub fn relation(&self, selector: Option<&str>, base_dir: Option<&Path>) -> Result<Relation, AuditError> {
        let relations = &self.config.relations;
        let known = || relations.iter().map(|r| r.id.as_str()).collect::<Vec<_>>().join(", ");

        let picked = match selector {
            Some(sel) => relations.iter().find(|r| {
                r.id.eq_ignore_ascii_case(sel)
                    || r.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(sel))
            }),
            None if relations.len() == 1 => relations.first(),
            None if relations.len() > 1 && base_dir.is_none() => {
                return Err(AuditError::Relation(format!(
                    "several relations configured ({}); name one",
                    known()
                )));
            }
            None => None,
        };

        match (picked, base_dir) {
            (Some(rel), dir) => Ok(Relation::from_config(rel, &self.base, dir)),
            (None, Some(dir)) => Ok(Relation::synthesized(selector.unwrap_or(DEFAULT_RELATION_ID), dir)),
            (None, None) => match selector {
                Some(sel) if !relations.is_empty() => Err(AuditError::Relation(format!(
                    "unknown relation '{sel}' (configured: {})",
                    known()
                ))),
                _ => Err(AuditError::Relation(
                    "no relation configured: pass --config or --base-dir".to_string(),
                )),
            },
        }
    }
}
