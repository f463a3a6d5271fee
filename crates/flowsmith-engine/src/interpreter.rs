//! Intent interpreter: free text to [`IntentDescriptor`].
//!
//! Two paths produce the same descriptor shape:
//!
//! 1. **Model path**: when an [`IntentModel`] is present and reports itself
//!    available, it is asked for a JSON classification under a timeout.
//! 2. **Keyword path**: a deterministic Aho-Corasick classifier. Used when
//!    there is no model, and whenever the model call fails, times out, or
//!    answers with something that is not the expected JSON.
//!
//! Integrations detected by keywords are always merged into the model's
//! answer so an obvious "telegram" in the prompt is never lost.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use flowsmith_llm::{ChatRequest, LlmClient};

use crate::error::{EngineError, Result};
use crate::intent::{
    ActionClass, Complexity, IntentDescriptor, IntentSource, OutputKind, is_messaging,
};

// ---------------------------------------------------------------------------
// Model seam
// ---------------------------------------------------------------------------

/// A classifier backed by a language model.
#[async_trait]
pub trait IntentModel: Send + Sync {
    /// Cheap check made before every call.
    fn is_available(&self) -> bool;

    /// Return the model's raw answer for `prompt`.
    async fn classify(&self, prompt: &str) -> Result<String>;
}

const MODEL_SYSTEM_PROMPT: &str = r#"You classify automation requests. Respond ONLY with a JSON object:
{
  "goal": "one sentence describing what the automation does",
  "action": "fetch" | "transform" | "send" | "store" | "hybrid",
  "complexity": "simple" | "medium" | "complex",
  "integrations": ["names", "from", "the", "list", "below"],
  "output": "message" | "file" | "notification" | "database"
}

Rules:
- "fetch" reads data, "send" delivers it to someone, "transform" reshapes it,
  "store" writes it to a database; use "hybrid" when more than one applies.
- Only list integrations from: {integrations}. Use [] when none apply.
- The request may be in any language."#;

/// [`IntentModel`] over the Flowsmith LLM client.
pub struct LlmIntentModel {
    client: Arc<LlmClient>,
    model: String,
}

impl LlmIntentModel {
    /// `model` may be empty to use the client's default.
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl IntentModel for LlmIntentModel {
    fn is_available(&self) -> bool {
        true
    }

    async fn classify(&self, prompt: &str) -> Result<String> {
        let names: Vec<_> = flowsmith_adapters::catalog::known_names().collect();
        let system = MODEL_SYSTEM_PROMPT.replace("{integrations}", &names.join(", "));
        let mut request = ChatRequest::classification(system, prompt);
        request.model = self.model.clone();

        let response = self
            .client
            .chat(&request)
            .await
            .map_err(|e| EngineError::ModelUnavailable(e.to_string()))?;
        Ok(response.text)
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Turns prompts into intent descriptors.
pub struct IntentInterpreter {
    model: Option<Arc<dyn IntentModel>>,
    timeout: Duration,
    keywords: KeywordClassifier,
}

impl IntentInterpreter {
    /// Keyword classification only.
    pub fn keywords_only() -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(20),
            keywords: KeywordClassifier::new(),
        }
    }

    /// Model classification with keyword fallback.
    pub fn with_model(model: Arc<dyn IntentModel>, timeout: Duration) -> Self {
        Self {
            model: Some(model),
            timeout,
            keywords: KeywordClassifier::new(),
        }
    }

    /// Interpret `prompt`. Fails only for an empty prompt.
    pub async fn interpret(&self, prompt: &str) -> Result<IntentDescriptor> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EngineError::InvalidInput("prompt is empty".into()));
        }

        let keyword_intent = self.keywords.classify(prompt);

        if let Some(model) = self.model.as_ref().filter(|m| m.is_available()) {
            match self.ask_model(model.as_ref(), prompt, &keyword_intent).await {
                Ok(intent) => {
                    info!(
                        action = %intent.action,
                        complexity = %intent.complexity,
                        integrations = ?intent.integrations,
                        "intent interpreted by model"
                    );
                    return Ok(intent);
                }
                Err(e) => warn!(error = %e, "model classification failed, using keywords"),
            }
        }

        info!(
            action = %keyword_intent.action,
            complexity = %keyword_intent.complexity,
            integrations = ?keyword_intent.integrations,
            unresolved = keyword_intent.unresolved,
            "intent interpreted by keywords"
        );
        Ok(keyword_intent)
    }

    async fn ask_model(
        &self,
        model: &dyn IntentModel,
        prompt: &str,
        keyword_intent: &IntentDescriptor,
    ) -> Result<IntentDescriptor> {
        let text = tokio::time::timeout(self.timeout, model.classify(prompt))
            .await
            .map_err(|_| {
                EngineError::ModelUnavailable(format!(
                    "no answer within {}s",
                    self.timeout.as_secs()
                ))
            })??;
        parse_model_response(&text, keyword_intent)
    }
}

/// Parse the model's JSON answer, merging in keyword-detected
/// integrations.
///
/// Handles markdown code fences that models sometimes emit.
pub fn parse_model_response(text: &str, keyword_intent: &IntentDescriptor) -> Result<IntentDescriptor> {
    let cleaned = text.trim();
    let cleaned = cleaned.strip_prefix("```json").unwrap_or(cleaned);
    let cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    let parsed: Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| EngineError::ModelUnavailable(format!("answer is not JSON: {e}")))?;

    fn field<T: serde::de::DeserializeOwned>(parsed: &Value, key: &str) -> Result<T> {
        serde_json::from_value(parsed[key].clone())
            .map_err(|e| EngineError::ModelUnavailable(format!("bad `{key}` in answer: {e}")))
    }

    let goal = parsed["goal"]
        .as_str()
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| keyword_intent.goal.clone());

    let mut integrations: BTreeSet<String> = parsed["integrations"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(|n| n.trim().to_ascii_lowercase())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    integrations.extend(keyword_intent.integrations.iter().cloned());

    Ok(IntentDescriptor {
        goal,
        action: field(&parsed, "action")?,
        complexity: field(&parsed, "complexity")?,
        integrations,
        output: field(&parsed, "output")?,
        unresolved: false,
        source: IntentSource::Model,
    })
}

// ---------------------------------------------------------------------------
// Keyword classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Integration(&'static str),
    Fetch,
    Transform,
    Store,
    Condition,
    Loop,
    File,
    Notify,
}

const KEYWORDS: &[(Signal, &[&str])] = &[
    (Signal::Integration("telegram"), &["telegram", "telegrama"]),
    (
        Signal::Integration("quote"),
        &[
            "dollar", "dollars", "dólar", "dolar", "euro", "euros", "currency", "currencies",
            "exchange rate", "quote", "quotes", "cotação", "cotacao", "cotações", "câmbio",
            "cambio", "moeda", "usd", "eur",
        ],
    ),
    (Signal::Integration("email"), &["email", "e-mail", "mail", "smtp"]),
    (Signal::Integration("slack"), &["slack"]),
    (
        Signal::Fetch,
        &[
            "fetch", "get", "search", "find", "look up", "lookup", "check", "monitor", "track",
            "buscar", "busque", "procurar", "consultar", "pegar",
        ],
    ),
    (
        Signal::Transform,
        &[
            "convert", "format", "summarize", "summarise", "report", "transform", "generate",
            "analyze", "analyse", "calculate", "compare", "resumir", "converter", "formatar",
            "relatório", "relatorio", "gerar", "gere",
        ],
    ),
    (
        Signal::Store,
        &[
            "database", "db", "table", "persist", "store in", "postgres", "postgresql", "sqlite",
            "banco de dados", "armazenar",
        ],
    ),
    (
        Signal::Condition,
        &[
            "if", "when", "only if", "unless", "above", "below", "greater than", "less than",
            "exceeds", "quando", "acima", "abaixo",
        ],
    ),
    (
        Signal::Loop,
        &["for each", "for every", "loop", "iterate", "repeat for", "para cada"],
    ),
    (
        Signal::File,
        &[
            "file", "csv", "json", "report", "html", "txt", "spreadsheet", "arquivo", "planilha",
            "relatório", "relatorio",
        ],
    ),
    (
        Signal::Notify,
        &[
            "notify", "notification", "alert", "remind", "notificar", "notificação", "alerta",
            "avise",
        ],
    ),
];

/// Words that carry no goal on their own.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "please", "me", "i", "it", "do", "something", "anything", "thing", "stuff",
    "um", "uma", "o", "por", "favor", "algo",
];

const MAX_GOAL_CHARS: usize = 120;

/// Deterministic classifier over a fixed multilingual keyword table.
pub struct KeywordClassifier {
    automaton: Option<AhoCorasick>,
    signals: Vec<Signal>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        let (signals, patterns): (Vec<Signal>, Vec<&str>) = KEYWORDS
            .iter()
            .flat_map(|(signal, words)| words.iter().map(move |w| (*signal, *w)))
            .unzip();
        let automaton = match AhoCorasick::new(&patterns) {
            Ok(ac) => Some(ac),
            Err(e) => {
                error!(error = %e, "failed to build keyword automaton");
                None
            }
        };
        Self { automaton, signals }
    }

    /// Signals present in `lower` as whole words.
    fn signals(&self, lower: &str) -> Vec<Signal> {
        let mut found = Vec::new();
        let Some(automaton) = &self.automaton else {
            return found;
        };
        for m in automaton.find_overlapping_iter(lower) {
            let before = lower[..m.start()].chars().next_back();
            let after = lower[m.end()..].chars().next();
            let bounded = !before.is_some_and(char::is_alphanumeric)
                && !after.is_some_and(char::is_alphanumeric);
            let signal = self.signals[m.pattern().as_usize()];
            if bounded && !found.contains(&signal) {
                found.push(signal);
            }
        }
        found
    }

    /// Classify `prompt` (assumed non-empty).
    pub fn classify(&self, prompt: &str) -> IntentDescriptor {
        let lower = prompt.to_lowercase();
        let signals = self.signals(&lower);
        let has = |s: Signal| signals.contains(&s);

        let integrations: BTreeSet<String> = signals
            .iter()
            .filter_map(|s| match s {
                Signal::Integration(name) => Some((*name).to_string()),
                _ => None,
            })
            .collect();
        let messaging = integrations.iter().any(|n| is_messaging(n));

        let unresolved = !has_goal(&lower);

        let mut classes = Vec::new();
        if integrations.contains("quote") || has(Signal::Fetch) {
            classes.push(ActionClass::Fetch);
        }
        if messaging {
            classes.push(ActionClass::Send);
        }
        if has(Signal::Transform) {
            classes.push(ActionClass::Transform);
        }
        if has(Signal::Store) {
            classes.push(ActionClass::Store);
        }
        let action = match (unresolved, classes.as_slice()) {
            (true, _) => ActionClass::Hybrid,
            (false, []) => ActionClass::Transform,
            (false, [one]) => *one,
            (false, _) => ActionClass::Hybrid,
        };

        let points = integrations.len()
            + usize::from(has(Signal::Condition))
            + usize::from(has(Signal::Loop))
            + usize::from(action == ActionClass::Hybrid);
        let complexity = match points {
            0 | 1 => Complexity::Simple,
            2 | 3 => Complexity::Medium,
            _ => Complexity::Complex,
        };

        let output = if has(Signal::Store) {
            OutputKind::Database
        } else if messaging {
            OutputKind::Message
        } else if has(Signal::File) {
            OutputKind::File
        } else if has(Signal::Notify) {
            OutputKind::Notification
        } else {
            OutputKind::File
        };

        debug!(signals = ?signals, points, "keyword classification");

        IntentDescriptor {
            goal: summarize_goal(prompt),
            action,
            complexity,
            integrations,
            output,
            unresolved,
            source: IntentSource::Keywords,
        }
    }
}

/// Whether `lower` has at least one word that is not a stop-word.
fn has_goal(lower: &str) -> bool {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|w| !STOP_WORDS.contains(&w))
}

/// Collapse whitespace and cap the length.
fn summarize_goal(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(MAX_GOAL_CHARS) {
        Some((idx, _)) => format!("{}…", &collapsed[..idx]),
        None => collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn classify(prompt: &str) -> IntentDescriptor {
        KeywordClassifier::new().classify(prompt)
    }

    #[test]
    fn dollar_quote_prompt_is_simple_fetch() {
        let intent = classify("send me the dollar quote every morning at a fixed interval");
        assert_eq!(intent.action, ActionClass::Fetch);
        assert_eq!(intent.complexity, Complexity::Simple);
        assert_eq!(intent.integrations, BTreeSet::from(["quote".to_string()]));
        assert_eq!(intent.output, OutputKind::File);
        assert!(!intent.unresolved);
    }

    #[test]
    fn telegram_delivery_is_hybrid_message() {
        let intent = classify("Envie a cotação do dólar pelo Telegram");
        assert_eq!(intent.action, ActionClass::Hybrid);
        assert_eq!(intent.output, OutputKind::Message);
        assert!(intent.wants("telegram"));
        assert!(intent.wants("quote"));
        assert_eq!(intent.complexity, Complexity::Medium);
    }

    #[test]
    fn keywords_need_word_boundaries() {
        // "db" inside "feedback", "mail" inside "mailbox", "if" inside "gift".
        let intent = classify("summarize customer feedback from the mailbox gift list");
        assert!(intent.integrations.is_empty());
        assert_eq!(intent.action, ActionClass::Transform);
        assert_eq!(intent.complexity, Complexity::Simple);
    }

    #[test]
    fn condition_loop_and_store_raise_complexity() {
        let intent = classify(
            "for each currency, if the euro is above 6 send it to slack and email and store in the database",
        );
        assert_eq!(intent.action, ActionClass::Hybrid);
        assert_eq!(intent.complexity, Complexity::Complex);
        assert_eq!(intent.output, OutputKind::Database);
    }

    #[test]
    fn stop_words_only_is_unresolved_hybrid() {
        let intent = classify("please do something");
        assert!(intent.unresolved);
        assert_eq!(intent.action, ActionClass::Hybrid);
        assert_eq!(intent.complexity, Complexity::Simple);

        assert!(classify("?!... ---").unresolved);
    }

    #[test]
    fn notify_without_channel_is_notification() {
        assert_eq!(classify("alert me about the weather").output, OutputKind::Notification);
        assert_eq!(classify("export the numbers as csv").output, OutputKind::File);
    }

    #[test]
    fn long_goals_are_capped() {
        let intent = classify(&"word ".repeat(100));
        assert_eq!(intent.goal.chars().count(), MAX_GOAL_CHARS + 1);
    }

    #[test]
    fn model_response_merges_keyword_integrations() {
        let keywords = classify("send the dollar quote to telegram");
        let text = "```json\n{\"goal\": \"Send USD quote\", \"action\": \"hybrid\", \"complexity\": \"medium\", \"integrations\": [\"Quote\"], \"output\": \"message\"}\n```";
        let intent = parse_model_response(text, &keywords).unwrap();
        assert_eq!(intent.source, IntentSource::Model);
        assert_eq!(intent.goal, "Send USD quote");
        assert!(intent.wants("quote"));
        assert!(intent.wants("telegram"));
    }

    #[test]
    fn malformed_model_response_is_rejected() {
        let keywords = classify("anything useful");
        assert!(parse_model_response("not json", &keywords).is_err());
        assert!(
            parse_model_response(r#"{"action": "dance", "complexity": "simple", "output": "file"}"#, &keywords)
                .is_err()
        );
    }

    struct ScriptedModel {
        answer: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IntentModel for ScriptedModel {
        fn is_available(&self) -> bool {
            true
        }
        async fn classify(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer
                .map(str::to_owned)
                .ok_or_else(|| EngineError::ModelUnavailable("offline".into()))
        }
    }

    fn scripted(answer: Option<&'static str>, delay: Duration) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel {
            answer,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn empty_prompt_is_invalid_input() {
        let interpreter = IntentInterpreter::keywords_only();
        let err = interpreter.interpret("   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn model_answer_is_used_when_valid() {
        let model = scripted(
            Some(r#"{"goal": "g", "action": "store", "complexity": "simple", "integrations": [], "output": "database"}"#),
            Duration::ZERO,
        );
        let interpreter = IntentInterpreter::with_model(model.clone(), Duration::from_secs(1));
        let intent = interpreter.interpret("keep a log").await.unwrap();
        assert_eq!(intent.source, IntentSource::Model);
        assert_eq!(intent.action, ActionClass::Store);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_model_falls_back_to_keywords() {
        let interpreter =
            IntentInterpreter::with_model(scripted(None, Duration::ZERO), Duration::from_secs(1));
        let intent = interpreter.interpret("dollar quote").await.unwrap();
        assert_eq!(intent.source, IntentSource::Keywords);
        assert!(intent.wants("quote"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out_to_keywords() {
        let model = scripted(
            Some(r#"{"goal": "g", "action": "store", "complexity": "simple", "integrations": [], "output": "database"}"#),
            Duration::from_secs(60),
        );
        let interpreter = IntentInterpreter::with_model(model, Duration::from_secs(2));
        let intent = interpreter.interpret("dollar quote").await.unwrap();
        assert_eq!(intent.source, IntentSource::Keywords);
    }
}
