//! Classifier adapter: message → prompt → LLM reply → validated events.
//!
//! The language model is reached through the [`Classifier`] trait so the
//! pipeline can be driven by a scripted stub in tests. Everything the model
//! answers is checked here before it can reach the sink: unknown taxonomy
//! keys and excerpts that are not literal substrings of the body are dropped.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sophism_types::{HIDDEN_TOPIC_KEY, Severity};
use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::Message;
use crate::taxonomy::Taxonomy;

pub const DEFAULT_MAX_BODY_CHARS: usize = 6000;
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
/// Neighbouring messages are only context; keep them short.
const NEIGHBOUR_CHARS: usize = 1200;
const MAX_EXCERPT_CHARS: usize = 240;
const DEFAULT_CONFIDENCE: f64 = 0.5;

// ── Events ──────────────────────────────────────────────────────────

/// One validated classifier finding for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub message_id: String,
    /// Taxonomy key or [`HIDDEN_TOPIC_KEY`]
    pub sophism_key: String,
    pub label: String,
    pub excerpt: String,
    pub severity: Severity,
    pub confidence: f64,
    pub note: String,
}

/// The complete, validated result for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub events: Vec<DetectionEvent>,
    /// Character count the body was cut to, when it was cut
    pub truncated_at: Option<usize>,
    /// Findings dropped by validation
    pub discarded: usize,
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unreachable: {0}")]
    Unreachable(String),

    #[error("classifier returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed classifier reply: {0}")]
    MalformedReply(String),

    #[error("all {0} findings in the reply were rejected")]
    Rejected(usize),

    #[error("classifier setup: {0}")]
    Setup(String),
}

impl ClassifierError {
    /// Retrying cannot help; the adapter gives up at once.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}

/// A message the adapter gave up on after its retry budget.
#[derive(Debug, Error)]
#[error("{message_id}: gave up after {attempts} attempt(s): {last}")]
pub struct ClassifyFailure {
    pub message_id: String,
    pub attempts: usize,
    #[source]
    pub last: ClassifierError,
}

// ── Request / boundary ──────────────────────────────────────────────

/// Everything the classifier sees about one message.
#[derive(Debug, Clone)]
pub struct ClassifyRequest<'a> {
    pub taxonomy: &'a Taxonomy,
    pub context_history: &'a str,
    pub owner_name: &'a str,
    pub relation_name: &'a str,
    pub message: &'a Message,
    /// Body as sent, possibly truncated
    pub body: &'a str,
    pub truncated_at: Option<usize>,
    pub before: Option<&'a str>,
    pub after: Option<&'a str>,
}

/// The external language model. Returns the raw reply text.
pub trait Classifier {
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError>;
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
/// Returns the kept prefix and, when something was cut, the cut point.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, Option<usize>) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], Some(max_chars)),
        None => (text, None),
    }
}

// ── Prompt ──────────────────────────────────────────────────────────

const SYSTEM_PROMPT: &str = "You are a rigorous analyst of family correspondence and of rhetorical \
manipulation (sophisms). Answer with STRICTLY VALID JSON and nothing outside the JSON.";

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(request: &ClassifyRequest<'_>) -> Prompt {
    let mut user = String::new();
    user.push_str(&format!(
        "Classify ONE message exchanged between {owner} and {relation}.\n\
         Reply with exactly this JSON shape:\n\
         {{\"findings\": [{{\"sophism_key\": \"<key>\", \"excerpt\": \"<verbatim quote>\", \
         \"severity\": \"low|medium|high\", \"confidence\": 0.0, \"note\": \"<short explanation>\"}}]}}\n\n\
         Rules:\n\
         - \"excerpt\" is copied character for character from the CURRENT MESSAGE body (at most {MAX_EXCERPT_CHARS} characters).\n\
         - \"sophism_key\" is one of the keys listed under TAXONOMY.\n\
         - Use \"{HIDDEN_TOPIC_KEY}\" for an undisclosed but implied matter (money, authority, promises), even without any fallacy.\n\
         - If nothing applies, reply {{\"findings\": []}}.\n\n",
        owner = request.owner_name,
        relation = request.relation_name,
    ));

    user.push_str("=== TAXONOMY ===\n");
    for entry in request.taxonomy.entries() {
        user.push_str(&format!("- {}: {}", entry.key, entry.label));
        if !entry.description.is_empty() {
            user.push_str(&format!(": {}", entry.description));
        }
        if !entry.aliases.is_empty() {
            user.push_str(&format!(" (also: {})", entry.aliases.join("; ")));
        }
        if !entry.cues.is_empty() {
            user.push_str(&format!(" (cues: {})", entry.cues.join("; ")));
        }
        user.push('\n');
    }
    user.push_str(&format!(
        "- {HIDDEN_TOPIC_KEY}: hidden topic: money, authority or promises implied but not stated openly\n\n"
    ));

    user.push_str("=== RELATION CONTEXT ===\n");
    let history = request.context_history.trim();
    user.push_str(if history.is_empty() { "(none)" } else { history });
    user.push_str("\n\n");

    if let Some(before) = request.before {
        user.push_str("=== PREVIOUS MESSAGE (context only) ===\n");
        user.push_str(truncate_chars(before, NEIGHBOUR_CHARS).0);
        user.push_str("\n\n");
    }

    let msg = request.message;
    user.push_str("=== CURRENT MESSAGE ===\n");
    user.push_str(&format!(
        "Date: {}\nFrom: {}\nTo: {}\nSubject: {}\n",
        msg.date_raw, msg.sender, msg.recipient, msg.subject
    ));
    if let Some(cut) = request.truncated_at {
        user.push_str(&format!("[body truncated to its first {cut} characters]\n"));
    }
    user.push_str("---\n");
    user.push_str(request.body);
    user.push_str("\n\n");

    if let Some(after) = request.after {
        user.push_str("=== NEXT MESSAGE (context only) ===\n");
        user.push_str(truncate_chars(after, NEIGHBOUR_CHARS).0);
        user.push('\n');
    }

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

// ── Reply parsing ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawReply {
    findings: Vec<serde_json::Value>,
}

/// One finding as the model wrote it, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFinding {
    #[serde(alias = "key", alias = "name")]
    pub sophism_key: String,
    #[serde(alias = "quote")]
    pub excerpt: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, alias = "explanation")]
    pub note: String,
}

/// Parsed reply: usable findings plus the number of entries that could not
/// even be read as a finding.
#[derive(Debug)]
pub struct ParsedReply {
    pub findings: Vec<RawFinding>,
    pub unreadable: usize,
}

/// Extract the JSON object from a reply (models sometimes wrap it in prose
/// or code fences) and read its `findings` list.
pub fn parse_reply(raw: &str) -> Result<ParsedReply, ClassifierError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => return Err(ClassifierError::MalformedReply("no JSON object in reply".to_string())),
    };
    let reply: RawReply =
        serde_json::from_str(json).map_err(|e| ClassifierError::MalformedReply(e.to_string()))?;

    let mut findings = Vec::with_capacity(reply.findings.len());
    let mut unreadable = 0;
    for value in reply.findings {
        match serde_json::from_value::<RawFinding>(value) {
            Ok(f) => findings.push(f),
            Err(e) => {
                warn!(error = %e, "unreadable finding in classifier reply");
                unreadable += 1;
            }
        }
    }
    Ok(ParsedReply {
        findings,
        unreadable,
    })
}

// ── Adapter ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub max_body_chars: usize,
    pub max_attempts: usize,
    pub retry_backoff: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

pub struct ClassifierAdapter<'a> {
    classifier: &'a dyn Classifier,
    taxonomy: &'a Taxonomy,
    context_history: &'a str,
    owner_name: &'a str,
    relation_name: &'a str,
    settings: AdapterSettings,
}

impl<'a> ClassifierAdapter<'a> {
    pub fn new(
        classifier: &'a dyn Classifier,
        taxonomy: &'a Taxonomy,
        context_history: &'a str,
        owner_name: &'a str,
        relation_name: &'a str,
        settings: AdapterSettings,
    ) -> Self {
        Self {
            classifier,
            taxonomy,
            context_history,
            owner_name,
            relation_name,
            settings,
        }
    }

    /// Classify one message, retrying transient and malformed replies with
    /// exponential backoff. A failure is never turned into "no finding".
    pub fn analyze(
        &self,
        message: &Message,
        before: Option<&Message>,
        after: Option<&Message>,
    ) -> Result<Analysis, ClassifyFailure> {
        let (body, truncated_at) = truncate_chars(&message.body, self.settings.max_body_chars);
        if let Some(cut) = truncated_at {
            debug!(message = %message.id, cut, "body truncated before classification");
        }
        let request = ClassifyRequest {
            taxonomy: self.taxonomy,
            context_history: self.context_history,
            owner_name: self.owner_name,
            relation_name: self.relation_name,
            message,
            body,
            truncated_at,
            before: before.map(|m| m.body.as_str()),
            after: after.map(|m| m.body.as_str()),
        };

        let budget = self.settings.max_attempts.max(1);
        let mut attempts = 0;
        let mut last = None;
        for attempt in 1..=budget {
            attempts = attempt;
            let outcome = self
                .classifier
                .classify(&request)
                .and_then(|raw| parse_reply(&raw))
                .and_then(|reply| self.validate(message, reply));
            match outcome {
                Ok(mut analysis) => {
                    analysis.truncated_at = truncated_at;
                    return Ok(analysis);
                }
                Err(e) => {
                    warn!(message = %message.id, attempt, error = %e, "classification attempt failed");
                    let permanent = e.is_permanent();
                    last = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
            if attempt < budget {
                thread::sleep(self.settings.retry_backoff * 2u32.saturating_pow(attempt as u32 - 1));
            }
        }

        Err(ClassifyFailure {
            message_id: message.id.clone(),
            attempts,
            last: last.unwrap_or_else(|| ClassifierError::MalformedReply("no attempt made".to_string())),
        })
    }

    /// Keep findings with a known key and a locatable excerpt. A reply whose
    /// findings were all unusable is rejected as a whole.
    fn validate(&self, message: &Message, reply: ParsedReply) -> Result<Analysis, ClassifierError> {
        let total = reply.findings.len() + reply.unreadable;
        let mut discarded = reply.unreadable;
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut events = Vec::new();

        for finding in reply.findings {
            let Some(key) = self.taxonomy.resolve(&finding.sophism_key) else {
                warn!(message = %message.id, key = %finding.sophism_key, "discarding finding with unknown taxonomy key");
                discarded += 1;
                continue;
            };
            let Some(excerpt) = locate_excerpt(&message.body, &finding.excerpt) else {
                warn!(message = %message.id, excerpt = %finding.excerpt, "discarding finding whose excerpt is not in the body");
                discarded += 1;
                continue;
            };
            if !seen.insert((key.to_string(), excerpt.to_string())) {
                continue;
            }

            let confidence = finding
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_CONFIDENCE);
            let severity = finding
                .severity
                .as_deref()
                .and_then(Severity::parse)
                .unwrap_or_else(|| Severity::from_confidence(confidence));

            events.push(DetectionEvent {
                message_id: message.id.clone(),
                sophism_key: key.to_string(),
                label: self.taxonomy.label_for(key).to_string(),
                excerpt: excerpt.to_string(),
                severity,
                confidence,
                note: finding.note.trim().to_string(),
            });
        }

        if total > 0 && events.is_empty() && discarded == total {
            return Err(ClassifierError::Rejected(total));
        }
        Ok(Analysis {
            events,
            truncated_at: None,
            discarded,
        })
    }
}

/// The excerpt as it literally appears in the body: verbatim first, then
/// with surrounding whitespace trimmed. No fuzzy matching.
fn locate_excerpt<'b>(body: &str, excerpt: &'b str) -> Option<&'b str> {
    [excerpt, excerpt.trim()]
        .into_iter()
        .find(|candidate| !candidate.trim().is_empty() && body.contains(candidate))
}

// ── OpenAI-compatible HTTP classifier ───────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub timeout: Duration,
}

pub struct OpenAiClassifier {
    client: reqwest::blocking::Client,
    api_key: String,
    settings: LlmSettings,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `sk-abcd…wxyz (len=51)`: enough to recognise a key in logs.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return format!("*** (len={})", chars.len());
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail} (len={})", chars.len())
}

impl OpenAiClassifier {
    pub fn new(api_key: String, settings: LlmSettings) -> Result<Self, ClassifierError> {
        let api_key = api_key.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        if api_key.is_empty() {
            return Err(ClassifierError::Setup("empty API key".to_string()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ClassifierError::Setup(e.to_string()))?;
        debug!(key = %mask_key(&api_key), model = %settings.model, "classifier ready");
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    /// Build from `OPENAI_API_KEY`.
    pub fn from_env(settings: LlmSettings) -> Result<Self, ClassifierError> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ClassifierError::Setup("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(key, settings)
    }
}

impl Classifier for OpenAiClassifier {
    fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        let prompt = build_prompt(request);
        let payload = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        debug!(message = %request.message.id, chars = prompt.user.len(), "sending classification request");

        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| ClassifierError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body: truncate_chars(&text, 300).0.to_string(),
            });
        }

        let chat: ChatResponse = response
            .json()
            .map_err(|e| ClassifierError::MalformedReply(e.to_string()))?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifierError::MalformedReply("reply has no content".to_string()))
    }
}

/// Stands in when no request may be sent (`--max 0`): every call fails.
pub struct OfflineClassifier;

impl Classifier for OfflineClassifier {
    fn classify(&self, _request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        Err(ClassifierError::Setup("classification disabled for this run".to_string()))
    }
}

// ── Test support ────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;

    /// Replies keyed by message id; unknown ids get an empty finding list.
    /// Ids mapped to `None` simulate an unreachable service.
    #[derive(Default)]
    pub struct StubClassifier {
        pub replies: RefCell<HashMap<String, Option<String>>>,
        pub calls: Cell<usize>,
        pub seen: RefCell<Vec<String>>,
    }

    impl StubClassifier {
        pub fn reply(self, message_id: &str, raw: &str) -> Self {
            self.replies
                .borrow_mut()
                .insert(message_id.to_string(), Some(raw.to_string()));
            self
        }

        pub fn unreachable(self, message_id: &str) -> Self {
            self.replies.borrow_mut().insert(message_id.to_string(), None);
            self
        }
    }

    impl Classifier for StubClassifier {
        fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
            self.calls.set(self.calls.get() + 1);
            self.seen.borrow_mut().push(request.message.id.clone());
            match self.replies.borrow().get(&request.message.id) {
                Some(Some(raw)) => Ok(raw.clone()),
                Some(None) => Err(ClassifierError::Unreachable("stub offline".to_string())),
                None => Ok(r#"{"findings": []}"#.to_string()),
            }
        }
    }

    /// Returns the scripted replies in order, one per call.
    pub struct SequenceClassifier {
        pub replies: RefCell<Vec<Result<String, ClassifierError>>>,
        pub calls: Cell<usize>,
    }

    impl SequenceClassifier {
        pub fn new(mut replies: Vec<Result<String, ClassifierError>>) -> Self {
            replies.reverse();
            Self {
                replies: RefCell::new(replies),
                calls: Cell::new(0),
            }
        }
    }

    impl Classifier for SequenceClassifier {
        fn classify(&self, _request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
            self.calls.set(self.calls.get() + 1);
            self.replies
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| Err(ClassifierError::Unreachable("script exhausted".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{SequenceClassifier, StubClassifier};
    use super::*;

    fn message(body: &str) -> Message {
        Message {
            id: "rel-2023-00002".to_string(),
            year: 2023,
            position: 2,
            sender: "m@example.org".to_string(),
            recipient: "y@example.org".to_string(),
            subject: "vacances".to_string(),
            date_raw: "2023-07-01".to_string(),
            timestamp: None,
            body: body.to_string(),
        }
    }

    fn settings() -> AdapterSettings {
        AdapterSettings {
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
            max_attempts: 3,
            retry_backoff: Duration::ZERO,
        }
    }

    fn adapter<'a>(classifier: &'a dyn Classifier, taxonomy: &'a Taxonomy) -> ClassifierAdapter<'a> {
        ClassifierAdapter::new(classifier, taxonomy, "Mère et fils, succession en cours.", "Yannick", "Maryvonne", settings())
    }

    const BODY: &str = "Après tout ce que j'ai fait pour toi, tu pourrais m'envoyer l'argent du loyer.";

    #[test]
    fn test_truncate_chars_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), ("hé", Some(2)));
        assert_eq!(truncate_chars("héllo", 5), ("héllo", None));
        assert_eq!(truncate_chars("héllo", 50), ("héllo", None));
        assert_eq!(truncate_chars("", 0), ("", None));
    }

    #[test]
    fn test_parse_reply_with_prose_around_json() {
        let raw = "Voici:\n```json\n{\"findings\": [{\"sophism_key\": \"straw_man\", \"excerpt\": \"x\"}]}\n```";
        let parsed = parse_reply(raw).unwrap();
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.findings[0].sophism_key, "straw_man");
        assert_eq!(parsed.unreadable, 0);
    }

    #[test]
    fn test_parse_reply_empty_findings() {
        let parsed = parse_reply(r#"{"findings": []}"#).unwrap();
        assert!(parsed.findings.is_empty());
    }

    #[test]
    fn test_parse_reply_malformed() {
        assert!(matches!(parse_reply("pas de json"), Err(ClassifierError::MalformedReply(_))));
        assert!(matches!(parse_reply(r#"{"result": []}"#), Err(ClassifierError::MalformedReply(_))));
        assert!(matches!(parse_reply(r#"{"findings": [}"#), Err(ClassifierError::MalformedReply(_))));
    }

    #[test]
    fn test_parse_reply_counts_unreadable_entries() {
        let parsed = parse_reply(r#"{"findings": [{"note": "no key"}, {"key": "a", "quote": "b"}]}"#).unwrap();
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.unreadable, 1);
    }

    #[test]
    fn test_prompt_lists_taxonomy_hidden_topic_and_context() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let before = message("message précédent");
        let msg = message(BODY);
        let request = ClassifyRequest {
            taxonomy: &taxonomy,
            context_history: "Succession de la maison familiale.",
            owner_name: "Yannick",
            relation_name: "Maryvonne",
            message: &msg,
            body: &msg.body,
            truncated_at: Some(42),
            before: Some(&before.body),
            after: None,
        };
        let prompt = build_prompt(&request);
        assert!(prompt.user.contains("- guilt_tripping: Culpabilisation"));
        assert!(prompt.user.contains("(also: culpabiliser; chantage affectif)"));
        assert!(prompt.user.contains(HIDDEN_TOPIC_KEY));
        assert!(prompt.user.contains("Succession de la maison familiale."));
        assert!(prompt.user.contains("message précédent"));
        assert!(prompt.user.contains("truncated to its first 42 characters"));
        assert!(prompt.user.contains(BODY));
        assert!(!prompt.user.contains("NEXT MESSAGE"));
        assert!(prompt.system.contains("JSON"));
    }

    #[test]
    fn test_valid_finding_becomes_event() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().reply(
            "rel-2023-00002",
            r#"{"findings": [{"sophism_key": "guilt_tripping", "excerpt": "Après tout ce que j'ai fait pour toi", "severity": "high", "confidence": 0.9, "note": "culpabilise"}]}"#,
        );
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.events.len(), 1);
        let e = &analysis.events[0];
        assert_eq!(e.sophism_key, "guilt_tripping");
        assert_eq!(e.label, "Culpabilisation");
        assert_eq!(e.severity, Severity::High);
        assert_eq!(e.message_id, "rel-2023-00002");
        assert_eq!(analysis.truncated_at, None);
    }

    #[test]
    fn test_unknown_key_and_foreign_excerpt_are_discarded() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().reply(
            "rel-2023-00002",
            r#"{"findings": [
                {"sophism_key": "guilt_tripping", "excerpt": "Après tout ce que j'ai fait"},
                {"sophism_key": "made_up_fallacy", "excerpt": "l'argent du loyer"},
                {"sophism_key": "straw_man", "excerpt": "une phrase inventée"}
            ]}"#,
        );
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.events.len(), 1);
        assert_eq!(analysis.discarded, 2);
        for e in &analysis.events {
            assert!(BODY.contains(&e.excerpt));
        }
    }

    #[test]
    fn test_alias_name_maps_to_taxonomy_key() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().reply(
            "rel-2023-00002",
            r#"{"findings": [{"sophism_key": "Chantage affectif", "excerpt": "Après tout ce que j'ai fait pour toi"}]}"#,
        );
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.discarded, 0);
        assert_eq!(analysis.events[0].sophism_key, "guilt_tripping");
        assert_eq!(analysis.events[0].label, "Culpabilisation");
    }

    #[test]
    fn test_hidden_topic_accepted() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().reply(
            "rel-2023-00002",
            r#"{"findings": [{"sophism_key": "hidden_topic", "excerpt": " l'argent du loyer ", "confidence": 0.3}]}"#,
        );
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.events[0].sophism_key, HIDDEN_TOPIC_KEY);
        assert_eq!(analysis.events[0].excerpt, "l'argent du loyer");
        assert_eq!(analysis.events[0].severity, Severity::Low);
    }

    #[test]
    fn test_duplicate_findings_collapsed() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().reply(
            "rel-2023-00002",
            r#"{"findings": [
                {"sophism_key": "guilt_tripping", "excerpt": "pour toi"},
                {"sophism_key": "Culpabilisation", "excerpt": "pour toi"}
            ]}"#,
        );
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.events.len(), 1);
    }

    #[test]
    fn test_empty_reply_means_no_finding() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default();
        let analysis = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert!(analysis.events.is_empty());
        assert_eq!(analysis.discarded, 0);
        assert_eq!(stub.calls.get(), 1);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let seq = SequenceClassifier::new(vec![
            Err(ClassifierError::Unreachable("timeout".to_string())),
            Ok("garbage".to_string()),
            Ok(r#"{"findings": []}"#.to_string()),
        ]);
        let analysis = adapter(&seq, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert!(analysis.events.is_empty());
        assert_eq!(seq.calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_bounded_attempts() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default().unreachable("rel-2023-00002");
        let failure = adapter(&stub, &taxonomy).analyze(&message(BODY), None, None).unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(stub.calls.get(), 3);
        assert!(matches!(failure.last, ClassifierError::Unreachable(_)));
    }

    #[test]
    fn test_setup_error_is_not_retried() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let seq = SequenceClassifier::new(vec![
            Err(ClassifierError::Setup("no key".to_string())),
            Ok(r#"{"findings": []}"#.to_string()),
        ]);
        let failure = adapter(&seq, &taxonomy).analyze(&message(BODY), None, None).unwrap_err();
        assert_eq!(seq.calls.get(), 1);
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.last, ClassifierError::Setup(_)));

        let failure = adapter(&OfflineClassifier, &taxonomy).analyze(&message(BODY), None, None).unwrap_err();
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn test_fully_rejected_reply_is_retried() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let seq = SequenceClassifier::new(vec![
            Ok(r#"{"findings": [{"sophism_key": "straw_man", "excerpt": "introuvable"}]}"#.to_string()),
            Ok(r#"{"findings": [{"sophism_key": "straw_man", "excerpt": "pour toi"}]}"#.to_string()),
        ]);
        let analysis = adapter(&seq, &taxonomy).analyze(&message(BODY), None, None).unwrap();
        assert_eq!(seq.calls.get(), 2);
        assert_eq!(analysis.events.len(), 1);
    }

    #[test]
    fn test_truncation_is_recorded() {
        let taxonomy = Taxonomy::bundled().unwrap();
        let stub = StubClassifier::default();
        let mut a = adapter(&stub, &taxonomy);
        a.settings.max_body_chars = 10;
        let analysis = a.analyze(&message(BODY), None, None).unwrap();
        assert_eq!(analysis.truncated_at, Some(10));
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-1234567890abcdef"), "sk-1234…cdef (len=19)");
        assert_eq!(mask_key("short"), "*** (len=5)");
    }

    #[test]
    fn test_openai_classifier_rejects_empty_key() {
        let settings = LlmSettings {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            OpenAiClassifier::new("  \"\" ".to_string(), settings),
            Err(ClassifierError::Setup(_))
        ));
    }
}
