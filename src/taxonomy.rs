use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sophism_types::HIDDEN_TOPIC_KEY;

use crate::error::AuditError;

const BUNDLED_TAXONOMY: &str = include_str!("../taxonomy/default.yaml");
const BUNDLED_SOURCE: &str = "<bundled taxonomy>";
pub const HIDDEN_TOPIC_LABEL: &str = "Sujet caché";

/// Minimum normalized Levenshtein similarity for a fuzzy name match.
const FUZZY_CUTOFF: f64 = 0.78;

/// One sophism definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    /// Derived from the label when the file leaves it out
    #[serde(default)]
    pub key: String,
    #[serde(alias = "name")]
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Other names a classifier reply may use for this entry
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub cues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// How a classifier-supplied name is matched against the taxonomy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MatchMode {
    /// Key, label or alias, then the closest name above the similarity cutoff
    #[default]
    Normalize,
    /// Key, label or alias only
    Strict,
}

/// The loaded, validated taxonomy. Read-only after construction.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    source: String,
    entries: Vec<TaxonomyEntry>,
    /// canonical key, label or alias → index into `entries`
    lookup: HashMap<String, usize>,
    mode: MatchMode,
}

/// Lowercase and collapse every non-alphanumeric run into `_`, so that
/// "Guilt-Tripping", "guilt tripping" and "guilt_tripping" compare equal.
pub fn canon_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut gap = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if gap && !out.is_empty() {
                out.push('_');
            }
            gap = false;
            out.extend(c.to_lowercase());
        } else {
            gap = true;
        }
    }
    out
}

impl Taxonomy {
    pub fn bundled() -> Result<Self, AuditError> {
        Self::from_yaml(BUNDLED_SOURCE, BUNDLED_TAXONOMY)
    }

    pub fn load(path: &Path) -> Result<Self, AuditError> {
        let text = fs::read_to_string(path).map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&path.display().to_string(), &text)
    }

    pub fn from_yaml(source_name: &str, text: &str) -> Result<Self, AuditError> {
        let entries: Vec<TaxonomyEntry> =
            serde_yaml::from_str(text).map_err(|e| AuditError::Taxonomy {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            })?;
        Self::from_entries(source_name, entries)
    }

    pub fn from_entries(source_name: &str, mut entries: Vec<TaxonomyEntry>) -> Result<Self, AuditError> {
        let invalid = |reason: String| AuditError::Taxonomy {
            source_name: source_name.to_string(),
            reason,
        };
        if entries.is_empty() {
            return Err(invalid("no entries".to_string()));
        }

        let mut keys: HashMap<String, usize> = HashMap::new();
        for (i, entry) in entries.iter_mut().enumerate() {
            if entry.label.trim().is_empty() {
                return Err(invalid(format!("entry #{} has an empty label", i + 1)));
            }
            if entry.key.trim().is_empty() {
                entry.key = canon_key(&entry.label);
            }
            let key = canon_key(&entry.key);
            if key.is_empty() {
                return Err(invalid(format!("entry #{} has an empty key", i + 1)));
            }
            if key == HIDDEN_TOPIC_KEY {
                return Err(invalid(format!("key '{HIDDEN_TOPIC_KEY}' is reserved")));
            }
            if keys.insert(key, i).is_some() {
                return Err(AuditError::DuplicateTaxonomyKey {
                    key: entry.key.clone(),
                    source_name: source_name.to_string(),
                });
            }
        }

        // Labels, then aliases, are fallback lookups only; keys always win.
        let mut lookup = keys;
        for (i, entry) in entries.iter().enumerate() {
            lookup.entry(canon_key(&entry.label)).or_insert(i);
        }
        for (i, entry) in entries.iter().enumerate() {
            for alias in &entry.aliases {
                let alias = canon_key(alias);
                if !alias.is_empty() {
                    lookup.entry(alias).or_insert(i);
                }
            }
        }

        Ok(Self {
            source: source_name.to_string(),
            entries,
            lookup,
            mode: MatchMode::default(),
        })
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Map a classifier-supplied name (key, label or alias, any casing) to
    /// the taxonomy key it designates, including the hidden-topic marker.
    /// In [`MatchMode::Normalize`] a near miss resolves to the closest name.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let canon = canon_key(name);
        if canon.is_empty() {
            return None;
        }
        if canon == HIDDEN_TOPIC_KEY {
            return Some(HIDDEN_TOPIC_KEY);
        }
        let index = match self.lookup.get(&canon) {
            Some(&i) => Some(i),
            None if self.mode == MatchMode::Normalize => self.closest(&canon),
            None => None,
        };
        index.map(|i| self.entries[i].key.as_str())
    }

    /// Best-scoring known name at or above [`FUZZY_CUTOFF`]. Ties go to
    /// the earlier entry.
    fn closest(&self, canon: &str) -> Option<usize> {
        let mut best: Option<(f64, usize)> = None;
        for (candidate, &i) in &self.lookup {
            let score = strsim::normalized_levenshtein(canon, candidate);
            if score < FUZZY_CUTOFF {
                continue;
            }
            let better = match best {
                None => true,
                Some((s, j)) => score > s || (score >= s && i < j),
            };
            if better {
                best = Some((score, i));
            }
        }
        best.map(|(_, i)| i)
    }

    pub fn label_for<'a>(&'a self, key: &'a str) -> &'a str {
        if key == HIDDEN_TOPIC_KEY {
            return HIDDEN_TOPIC_LABEL;
        }
        self.get(key).map(|e| e.label.as_str()).unwrap_or(key)
    }
}
