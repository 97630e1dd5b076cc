//! Rule-based message analysis, run before the model sees the turn.
//!
//! Everything here is pattern matching over the caller's latest message:
//! - emotion and its intensity
//! - intents and topics
//! - policy-relevant keywords
//! - incident category and a declared insurer
//!
//! The enricher turns that reading into tone and policy notes for the prompt.

use regex::Regex;
use tracing::debug;

use crate::escalation::IncidentType;
use crate::pipeline::types::{
    Analysis, Emotion, EmotionLevel, Enrichment, Intent, PolicyKeyword, Topic,
};
use crate::session::SessionState;

/// Words the insurer pattern can capture that are not insurer names.
const INSURER_STOPWORDS: &[&str] = &["que", "una", "otra", "misma", "esa", "esta", "del", "los"];

/// A compiled pattern tagged with what it means.
#[derive(Debug, Clone)]
struct Tagged<T> {
    tag: T,
    regex: Regex,
}

fn tagged<T>(tag: T, pattern: &str) -> Tagged<T> {
    Tagged {
        tag,
        regex: Regex::new(&format!("(?i){pattern}")).unwrap(),
    }
}

/// Pattern-based classifier for caller messages.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    emotions: Vec<Tagged<Emotion>>,
    intents: Vec<Tagged<Intent>>,
    topics: Vec<Tagged<Topic>>,
    policy_keywords: Vec<Tagged<PolicyKeyword>>,
    insurer: Vec<Regex>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier {
    pub fn new() -> Self {
        let emotions = vec![
            tagged(
                Emotion::Frustration,
                r"molest|cansad|harto|hart[ao]|indignad|inaceptable|p[eé]simo|terrible|siempre lo mismo|otra vez|nunca",
            ),
            tagged(
                Emotion::Confusion,
                r"no entiendo|no s[eé]|confundid|c[oó]mo as[ií]|no me queda claro|qu[eé] significa|\?\s*\?",
            ),
            tagged(
                Emotion::Positive,
                r"gracias|perfecto|excelente|muy amable|de acuerdo|listo|genial",
            ),
        ];

        let intents = vec![
            tagged(Intent::Confirm, r"\b(s[ií]|claro|correcto|confirmo|as[ií] es|exacto)\b"),
            tagged(Intent::Deny, r"\b(no|negativo|para nada)\b"),
            tagged(Intent::Change, r"cambi|modific|reprogram|mover la cita|otra direcci[oó]n"),
            tagged(Intent::Cancel, r"cancel|anular|ya no (lo )?necesito"),
            tagged(Intent::Complaint, r"queja|reclam|inconformidad|mal servicio"),
            tagged(Intent::Question, r"\?|\b(c[oó]mo|cu[aá]ndo|d[oó]nde|qu[eé]|por qu[eé])\b"),
            tagged(Intent::Greeting, r"\b(hola|buen[oa]s (d[ií]as|tardes|noches)|al[oó])\b"),
        ];

        let topics = vec![
            tagged(Topic::Schedule, r"\bhora\b|horario|a las \d|\d{1,2}:\d{2}|\bam\b|\bpm\b"),
            tagged(Topic::Address, r"direcci[oó]n|calle|carrera|\bcra\b|barrio|avenida|recog"),
            tagged(Topic::Driver, r"conductor|chofer|m[oó]vil|carro|veh[ií]culo"),
            tagged(
                Topic::Date,
                r"fecha|ma[nñ]ana|\bhoy\b|lunes|martes|mi[eé]rcoles|jueves|viernes|s[aá]bado|domingo|\d{1,2}/\d{1,2}",
            ),
            tagged(Topic::Service, r"servicio|terapia|cita|di[aá]lisis|consulta|tratamiento"),
        ];

        let policy_keywords = vec![
            tagged(
                PolicyKeyword::AddressChange,
                r"(cambi|nueva|otra).{0,20}direcci[oó]n|me mud[eé]",
            ),
            tagged(PolicyKeyword::CoverageZone, r"vereda|rural|corregimiento|finca|municipio"),
            tagged(PolicyKeyword::Companion, r"acompa[nñ]ante|acompa[nñ]ar|ir con (mi|alguien)"),
            tagged(PolicyKeyword::Driver, r"conductor|chofer"),
            tagged(PolicyKeyword::Minor, r"menor de edad|mi hij[oa]|\bni[nñ][oa]\b|\btengo \d{1,2} a[nñ]os"),
        ];

        let insurer = vec![
            Regex::new(r"(?i)\beps\s+(?:es\s+)?(?:la\s+|el\s+)?([\p{L}]{3,})").unwrap(),
            Regex::new(r"(?i)\bafiliad[oa]\s+(?:a|en)\s+(?:la\s+|el\s+)?(?:eps\s+)?([\p{L}]{3,})")
                .unwrap(),
        ];

        Self {
            emotions,
            intents,
            topics,
            policy_keywords,
            insurer,
        }
    }

    /// Read one caller message.
    pub fn analyze(&self, message: &str) -> Analysis {
        let (emotion, emotion_level) = self.detect_emotion(message);
        let intents = matching(&self.intents, message);
        let topics = matching(&self.topics, message);
        let policy_keywords = matching(&self.policy_keywords, message);
        let incident_type = IncidentType::detect(message);
        let declared_insurer = self.detect_insurer(message);

        let needs_empathy = matches!(emotion, Emotion::Frustration | Emotion::Confusion)
            && emotion_level >= EmotionLevel::Medium;

        let analysis = Analysis {
            emotion,
            emotion_level,
            intents,
            topics,
            policy_keywords,
            incident_type,
            declared_insurer,
            needs_empathy,
        };
        debug!(
            emotion = ?analysis.emotion,
            level = ?analysis.emotion_level,
            intents = analysis.intents.len(),
            incident = ?analysis.incident_type,
            "Message analyzed"
        );
        analysis
    }

    /// Strongest emotion by match count; negative emotions win ties.
    fn detect_emotion(&self, message: &str) -> (Emotion, EmotionLevel) {
        let best = self
            .emotions
            .iter()
            .map(|t| (t.tag, t.regex.find_iter(message).count()))
            .filter(|(_, count)| *count > 0)
            .fold(None::<(Emotion, usize)>, |best, candidate| match best {
                Some((_, top)) if top >= candidate.1 => best,
                _ => Some(candidate),
            });

        match best {
            None => (Emotion::Neutral, EmotionLevel::Low),
            Some((emotion, count)) => {
                let level = match count {
                    0..=1 => EmotionLevel::Low,
                    2 => EmotionLevel::Medium,
                    _ => EmotionLevel::High,
                };
                (emotion, level)
            }
        }
    }

    fn detect_insurer(&self, message: &str) -> Option<String> {
        self.insurer.iter().find_map(|re| {
            let name = re.captures(message)?.get(1)?.as_str();
            let lower = name.to_lowercase();
            (!INSURER_STOPWORDS.contains(&lower.as_str())).then(|| name.to_string())
        })
    }
}

fn matching<T: Copy>(patterns: &[Tagged<T>], message: &str) -> Vec<T> {
    patterns
        .iter()
        .filter(|t| t.regex.is_match(message))
        .map(|t| t.tag)
        .collect()
}

// ── Enrichment ──────────────────────────────────────────────────────

/// Turns an [`Analysis`] into prompt guidance and folds declared data into
/// the session.
#[derive(Debug, Clone, Default)]
pub struct ContextEnricher;

impl ContextEnricher {
    pub fn enrich(&self, analysis: &Analysis, state: &mut SessionState) -> Enrichment {
        if let Some(insurer) = &analysis.declared_insurer
            && state.patient.insurer.is_none()
        {
            state.patient.insurer = Some(insurer.clone());
        }

        let tone_instruction = match (analysis.emotion, analysis.needs_empathy) {
            (Emotion::Frustration, true) => {
                "El usuario está molesto. Empieza reconociendo su molestia con una frase \
                 empática breve antes de continuar."
            }
            (Emotion::Confusion, true) => {
                "El usuario está confundido. Explica con frases cortas y confirma que \
                 entendió antes de avanzar."
            }
            (Emotion::Positive, _) => "El usuario está receptivo. Mantén un tono cordial y ágil.",
            _ => "Mantén un tono cordial, claro y profesional.",
        }
        .to_string();

        let policy_notes = analysis
            .policy_keywords
            .iter()
            .map(|keyword| {
                match keyword {
                    PolicyKeyword::AddressChange => {
                        "Un cambio de dirección debe quedar registrado completo (calle, número y barrio)."
                    }
                    PolicyKeyword::CoverageZone => {
                        "Verifica que la dirección esté dentro del perímetro urbano cubierto."
                    }
                    PolicyKeyword::Companion => {
                        "Se permite un acompañante cuando el paciente lo requiere."
                    }
                    PolicyKeyword::Driver => {
                        "No prometas un conductor específico; se asigna según disponibilidad."
                    }
                    PolicyKeyword::Minor => {
                        "Si habla un menor de edad, no compartas datos del servicio; pide hablar con un adulto."
                    }
                }
                .to_string()
            })
            .collect();

        Enrichment {
            tone_instruction,
            policy_notes,
        }
    }
}
