//! Post-model checks on the reply before the caller hears it.
//!
//! Three layers, applied in order:
//! 1. Critical failures replace the reply with a safe template.
//! 2. Deterministic corrections rewrite known phrasing mistakes.
//! 3. Warnings are recorded but leave the text alone.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::llm::extract_json_object;
use crate::pipeline::prompts::greeting_for_hour;
use crate::pipeline::types::{Analysis, Emotion, PolicyKeyword};
use crate::policy::{PolicyCategory, PolicyViolation};

/// Reply used when the model produced nothing usable.
pub const EMPTY_REPLY_FALLBACK: &str = "Disculpe, ¿podría repetir eso? No escuché bien.";

/// Reply used when protected trip details were about to reach a minor.
pub const MINOR_CONTACT_FALLBACK: &str = "Gracias. Por seguridad, necesito hablar con un adulto \
                                          responsable del paciente. ¿Me lo podría comunicar, por favor?";

const KINSHIP: &str = "hijo|hija|esposo|esposa|mamá|papá|madre|padre|hermano|hermana|abuelo|abuela|nieto|nieta|tío|tía";

const WEEKDAY: &str = "lunes|martes|miércoles|miercoles|jueves|viernes|sábado|sabado|domingo";

const EMPATHY_WORDS: &[&str] = &[
    "entiendo",
    "lamento",
    "comprendo",
    "disculp",
    "tiene razón",
    "es frustrante",
    "molestia",
];

static SENORA_KINSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bSra\.\s*(?:{KINSHIP})\b")).unwrap());

static SENOR_KINSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bSr\.\s*(?:{KINSHIP})\b")).unwrap());

static GREETING_HEDGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbuen[oa]s\s+(?:d[ií]as|tardes|noches)\s*/\s*(?:d[ií]as|tardes|noches)")
        .unwrap()
});

static DOUBLED_WEEKDAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b({WEEKDAY})\b,?\s*\b({WEEKDAY})\b")).unwrap());

static BLANK_REPLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\s.,]*$").unwrap());

static PROTECTED_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d{1,2}:\d{2}\b|\ba las \d|\b\d{1,2}/\d{1,2}\b|\bcalle\b|\bcarrera\b|\bcra\.?\s*\d|direcci[oó]n\s+(es|ser[aá])",
    )
    .unwrap()
});

static COVERAGE_PROMISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)s[ií] podemos|no hay problema|claro que (s[ií] )?(lo|la) recogemos").unwrap()
});

static DRIVER_PROMISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)le asignar[eé]|voy a asignar|le (aseguro|garantizo) (que )?(el mismo|ese) conductor")
        .unwrap()
});

/// What validation did to a reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub text: String,
    /// Names of the corrections applied.
    pub corrections: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether a safe template replaced the reply.
    pub fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    pub fn validate(
        &self,
        text: &str,
        minor_contact: bool,
        analysis: &Analysis,
        violations: &[PolicyViolation],
        hour: u32,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome {
            text: text.trim().to_string(),
            ..Default::default()
        };

        // Leaked JSON: salvage the reply field if there is one.
        if outcome.text.contains("\"agent_response\"") {
            let salvaged = serde_json::from_str::<serde_json::Value>(&extract_json_object(&outcome.text))
                .ok()
                .and_then(|v| v.get("agent_response")?.as_str().map(str::to_string));
            outcome.text = salvaged.unwrap_or_default();
            outcome.corrections.push("leaked_json".to_string());
        }

        if BLANK_REPLY.is_match(&outcome.text) {
            return self.fallback(outcome, EMPTY_REPLY_FALLBACK, "empty_reply");
        }

        if minor_contact && PROTECTED_DETAIL.is_match(&outcome.text) {
            return self.fallback(outcome, MINOR_CONTACT_FALLBACK, "minor_contact_disclosure");
        }

        self.apply_corrections(&mut outcome, hour);
        self.collect_warnings(&mut outcome, analysis, violations);

        if !outcome.corrections.is_empty() {
            debug!(corrections = ?outcome.corrections, "Reply corrected");
        }
        outcome
    }

    fn fallback(&self, mut outcome: ValidationOutcome, template: &str, reason: &str) -> ValidationOutcome {
        warn!(reason, "Reply replaced by safe template");
        outcome.text = template.to_string();
        outcome.corrections.push(reason.to_string());
        outcome.fallback = true;
        outcome
    }

    fn apply_corrections(&self, outcome: &mut ValidationOutcome, hour: u32) {
        let mut text = std::mem::take(&mut outcome.text);
        let fixes = &mut outcome.corrections;

        rewrite(fixes, "kinship_as_name", &SENORA_KINSHIP, &mut text, |_| "señora".to_string());
        rewrite(fixes, "kinship_as_name", &SENOR_KINSHIP, &mut text, |_| "señor".to_string());
        rewrite(fixes, "greeting_hedge", &GREETING_HEDGE, &mut text, |_| {
            greeting_for_hour(hour).to_string()
        });
        rewrite(fixes, "duplicated_weekday", &DOUBLED_WEEKDAY, &mut text, |caps| {
            if caps[1].to_lowercase() == caps[2].to_lowercase() {
                caps[1].to_string()
            } else {
                caps[0].to_string()
            }
        });

        if let Some(deduped) = drop_repeated_sentences(&text) {
            text = deduped;
            fixes.push("duplicated_sentence".to_string());
        }
        fixes.dedup();
        outcome.text = text;
    }

    fn collect_warnings(
        &self,
        outcome: &mut ValidationOutcome,
        analysis: &Analysis,
        violations: &[PolicyViolation],
    ) {
        let lower = outcome.text.to_lowercase();

        if analysis.needs_empathy
            && analysis.emotion == Emotion::Frustration
            && !EMPATHY_WORDS.iter().any(|w| lower.contains(w))
        {
            outcome.warnings.push("missing_empathy".to_string());
        }

        let coverage_in_play = violations.iter().any(|v| v.category == PolicyCategory::Coverage)
            || analysis.policy_keywords.contains(&PolicyKeyword::CoverageZone);
        if coverage_in_play && COVERAGE_PROMISE.is_match(&outcome.text) {
            outcome.warnings.push("coverage_contradiction".to_string());
        }

        let driver_in_play = violations.iter().any(|v| v.category == PolicyCategory::Driver)
            || analysis.policy_keywords.contains(&PolicyKeyword::Driver);
        if driver_in_play && DRIVER_PROMISE.is_match(&outcome.text) {
            outcome.warnings.push("driver_promise".to_string());
        }

        if !outcome.warnings.is_empty() {
            warn!(warnings = ?outcome.warnings, "Reply may contradict policy or tone");
        }
    }
}

/// Replace every match of `re`, recording `name` when the text changed.
fn rewrite(
    corrections: &mut Vec<String>,
    name: &str,
    re: &Regex,
    text: &mut String,
    replacement: impl Fn(&Captures) -> String,
) {
    let replaced = re.replace_all(text.as_str(), |caps: &Captures| replacement(caps)).into_owned();
    if replaced != *text {
        *text = replaced;
        corrections.push(name.to_string());
    }
}

/// Split into sentences, keeping the terminal punctuation.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                out.push(text[start..end].trim());
                start = end;
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Remove a sentence repeated right after itself. `None` when nothing repeats.
fn drop_repeated_sentences(text: &str) -> Option<String> {
    let parts = sentences(text);
    let mut kept: Vec<&str> = Vec::with_capacity(parts.len());
    for part in parts.iter().copied() {
        let repeated = kept
            .last()
            .is_some_and(|prev| prev.to_lowercase() == part.to_lowercase());
        if !repeated {
            kept.push(part);
        }
    }
    (kept.len() != parts.len()).then(|| kept.join(" "))
}
