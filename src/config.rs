//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name the agent introduces itself with.
    pub agent_name: String,
    /// Transport company the agent works for.
    pub company_name: String,
    /// Health insurer (EPS) whose members the service covers.
    pub insurer_name: String,
    /// Insurer phone line given to callers on escalation.
    pub insurer_hotline: String,
    /// Insurer website given to callers on escalation.
    pub insurer_website: String,
    /// Session time-to-live in the store.
    pub session_ttl: Duration,
    /// How many logged messages are forwarded to the model.
    pub history_window: usize,
    /// Turns after which the call is handed to a human.
    pub max_turns: u32,
    /// Deadline for a single model call.
    pub llm_timeout: Duration,
    /// Token that opens an outbound call without a model call.
    pub start_sentinel: String,
    /// Offset of the call center's local time, for greetings and dates.
    pub utc_offset_hours: i32,
    /// Address fragments that mark rural or uncovered pickup zones.
    pub coverage_markers: Vec<String>,
    /// Cities outside the operating area, matched as whole words.
    pub out_of_area_cities: Vec<String>,
    /// Phrases in a caller message that put the request out of scope.
    pub escalation_keywords: Vec<String>,
    /// Optional libSQL database path. In-memory store when unset.
    pub db_path: Option<PathBuf>,
    /// Optional JSON file with patient records for outbound calls.
    pub patients_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "María".to_string(),
            company_name: "Transformas".to_string(),
            insurer_name: "Cosalud".to_string(),
            insurer_hotline: "018000-123456".to_string(),
            insurer_website: "www.cosalud.com.co".to_string(),
            session_ttl: Duration::from_secs(3600), // 1 hour
            history_window: 20,
            max_turns: 50,
            llm_timeout: Duration::from_secs(30),
            start_sentinel: "START".to_string(),
            utc_offset_hours: -5,
            coverage_markers: to_strings(&["vereda", "rural", "corregimiento", "campo", "km"]),
            out_of_area_cities: to_strings(&["bogotá", "cali", "cartagena", "barranquilla"]),
            escalation_keywords: to_strings(&[
                "servicio expreso",
                "servicio express",
                "urgente ya",
                "inmediato",
                "fuera de la ciudad",
                "zona rural",
                "no autorizado",
                "sin autorización",
                "zona no cubierta",
            ]),
            db_path: None,
            patients_file: None,
        }
    }
}

impl AgentConfig {
    /// Build configuration from `MEDTRIP_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ttl_secs: u64 = env_parse("MEDTRIP_SESSION_TTL_SECS").unwrap_or(3600);
        let timeout_secs: u64 = env_parse("MEDTRIP_LLM_TIMEOUT_SECS").unwrap_or(30);

        Self {
            agent_name: env_string("MEDTRIP_AGENT_NAME").unwrap_or(defaults.agent_name),
            company_name: env_string("MEDTRIP_COMPANY_NAME").unwrap_or(defaults.company_name),
            insurer_name: env_string("MEDTRIP_INSURER_NAME").unwrap_or(defaults.insurer_name),
            insurer_hotline: env_string("MEDTRIP_INSURER_HOTLINE")
                .unwrap_or(defaults.insurer_hotline),
            insurer_website: env_string("MEDTRIP_INSURER_WEBSITE")
                .unwrap_or(defaults.insurer_website),
            session_ttl: Duration::from_secs(ttl_secs),
            history_window: env_parse("MEDTRIP_HISTORY_WINDOW").unwrap_or(defaults.history_window),
            max_turns: env_parse("MEDTRIP_MAX_TURNS").unwrap_or(defaults.max_turns),
            llm_timeout: Duration::from_secs(timeout_secs),
            start_sentinel: env_string("MEDTRIP_START_SENTINEL")
                .unwrap_or(defaults.start_sentinel),
            utc_offset_hours: env_parse("MEDTRIP_UTC_OFFSET_HOURS")
                .unwrap_or(defaults.utc_offset_hours),
            coverage_markers: env_string("MEDTRIP_COVERAGE_MARKERS")
                .map(|s| parse_list(&s))
                .unwrap_or(defaults.coverage_markers),
            out_of_area_cities: env_string("MEDTRIP_OUT_OF_AREA_CITIES")
                .map(|s| parse_list(&s))
                .unwrap_or(defaults.out_of_area_cities),
            escalation_keywords: env_string("MEDTRIP_ESCALATION_KEYWORDS")
                .map(|s| parse_list(&s))
                .unwrap_or(defaults.escalation_keywords),
            db_path: env_string("MEDTRIP_DB_PATH").map(PathBuf::from),
            patients_file: env_string("MEDTRIP_PATIENTS_FILE").map(PathBuf::from),
        }
    }

    /// The call center's timezone. Falls back to UTC for out-of-range offsets.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

/// Split a comma-separated list into trimmed, lowercased entries, dropping
/// blanks. Every list is matched case-insensitively.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_setup() {
        let config = AgentConfig::default();
        assert_eq!(config.agent_name, "María");
        assert_eq!(config.insurer_name, "Cosalud");
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.history_window, 20);
        assert_eq!(config.start_sentinel, "START");
        assert!(config.coverage_markers.contains(&"vereda".to_string()));
    }

    #[test]
    fn parse_list_drops_blanks_and_lowercases() {
        let list = parse_list("Vereda, ,Rural,, km ");
        assert_eq!(list, vec!["vereda", "rural", "km"]);

        let keywords = parse_list("urgente ya, Inmediato");
        assert_eq!(keywords, vec!["urgente ya", "inmediato"]);
    }

    #[test]
    fn local_offset_is_bogota_by_default() {
        let config = AgentConfig::default();
        assert_eq!(config.local_offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn invalid_offset_falls_back_to_utc() {
        let config = AgentConfig {
            utc_offset_hours: 99,
            ..Default::default()
        };
        assert_eq!(config.local_offset().local_minus_utc(), 0);
    }
}
