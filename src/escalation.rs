//! Escalation rules: when automated handling must stop and hand the call to
//! the insurer.
//!
//! Each check is independent and returns `(should_escalate, reason)`;
//! [`EscalationRules::check_escalation_needed`] runs all of them.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

// ── Incident types ──────────────────────────────────────────────────

/// Category of a problem reported during a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    DriverComplaint,
    Lateness,
    DriverRotation,
    UnsuitableVehicle,
    NoWheelchairSpace,
    ZoneNotCovered,
    UserOutOfCity,
    ServiceNotProvided,
    RescheduleNotReflected,
    CommunicationFailure,
    Other,
}

/// How urgently an incident needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
}

/// Classification patterns, checked in order. Earlier entries win, so the
/// more specific phrasing ("no llegó a tiempo") precedes the broader one
/// ("no llegó").
static INCIDENT_PATTERNS: LazyLock<Vec<(IncidentType, Regex)>> = LazyLock::new(|| {
    use IncidentType::*;
    [
        (ZoneNotCovered, r"zona no cubierta|no (hay|tienen) cobertura|sin cobertura"),
        (UserOutOfCity, r"fuera de la ciudad|no estoy en la ciudad|estoy de viaje"),
        (Lateness, r"no lleg[oó] a tiempo|lleg[oó] tarde|impuntual|retras"),
        (ServiceNotProvided, r"no (lleg[oó]|vino|pasaron|me recogieron)|nunca lleg|me dejaron esperando"),
        (NoWheelchairSpace, r"silla de ruedas.*(no cab|espacio)|(no cab|sin espacio).*silla"),
        (UnsuitableVehicle, r"veh[ií]culo.*(sucio|malo|inadecuado|dañado|pequeño)"),
        (DriverRotation, r"(cambian|rotan|siempre otro).*conductor|conductor.*(diferente|distinto)"),
        (DriverComplaint, r"conductor.*(grosero|irrespetuoso|maltrat|mal servicio)|queja.*conductor"),
        (RescheduleNotReflected, r"reprogram|cambiaron (la|mi) cita"),
        (CommunicationFailure, r"no (me )?(llamaron|avisaron|contestan)|nadie (me )?(llam|contest)"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(&format!("(?i){pattern}")).unwrap()))
    .collect()
});

impl IncidentType {
    /// Whether this kind of incident always needs the insurer.
    pub fn requires_escalation(&self) -> bool {
        matches!(
            self,
            Self::ZoneNotCovered | Self::UserOutOfCity | Self::ServiceNotProvided
        )
    }

    pub fn severity(&self) -> IncidentSeverity {
        use IncidentType::*;
        match self {
            ServiceNotProvided | ZoneNotCovered | UserOutOfCity => IncidentSeverity::High,
            Lateness | UnsuitableVehicle | NoWheelchairSpace | RescheduleNotReflected => {
                IncidentSeverity::Medium
            }
            DriverComplaint | DriverRotation | CommunicationFailure | Other => IncidentSeverity::Low,
        }
    }

    /// Spanish label, used in caller-facing text.
    pub fn display_name(&self) -> &'static str {
        use IncidentType::*;
        match self {
            DriverComplaint => "Queja del conductor",
            Lateness => "Impuntualidad",
            DriverRotation => "Rotación excesiva de conductores",
            UnsuitableVehicle => "Vehículo inadecuado",
            NoWheelchairSpace => "Falta espacio para silla de ruedas",
            ZoneNotCovered => "Zona no cubierta",
            UserOutOfCity => "Usuario fuera de la ciudad",
            ServiceNotProvided => "Servicio no prestado",
            RescheduleNotReflected => "Cita reprogramada no reflejada",
            CommunicationFailure => "Falla de comunicación",
            Other => "Otro",
        }
    }

    /// Classify free text, if it describes a known kind of incident.
    pub fn detect(text: &str) -> Option<IncidentType> {
        INCIDENT_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(kind, _)| *kind)
    }

    /// Classify an incident summary, defaulting to [`IncidentType::Other`].
    pub fn classify(summary: &str) -> IncidentType {
        Self::detect(summary).unwrap_or(Self::Other)
    }

    /// Parse a wire label (case-insensitive), defaulting to `Other`.
    pub fn from_label(label: &str) -> IncidentType {
        serde_json::from_value(serde_json::Value::String(label.trim().to_ascii_uppercase()))
            .unwrap_or(Self::Other)
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// What the escalation checks look at for one turn.
#[derive(Debug, Clone, Default)]
pub struct EscalationInput<'a> {
    pub incident_type: Option<IncidentType>,
    pub pickup_address: Option<&'a str>,
    pub destination_address: Option<&'a str>,
    pub express_requested: bool,
    pub has_authorization: Option<bool>,
    pub user_message: Option<&'a str>,
}

/// Outcome of all checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EscalationDecision {
    pub escalate: bool,
    pub reasons: Vec<String>,
}

impl EscalationDecision {
    /// Reasons joined into one line.
    pub fn reason_text(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Case-insensitive pattern matching any marker at the start of a word, so
/// "km" finds "Km 5" but not "Bkm".
pub fn marker_pattern(markers: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = markers
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b(?:{})", alternatives.join("|"))).ok()
}

/// Configured escalation checks.
#[derive(Debug, Clone)]
pub struct EscalationRules {
    coverage_markers: Option<Regex>,
    out_of_area_cities: Vec<(String, Regex)>,
    keywords: Vec<String>,
    insurer_name: String,
    insurer_hotline: String,
    insurer_website: String,
}

impl EscalationRules {
    pub fn from_config(config: &AgentConfig) -> Self {
        let out_of_area_cities = config
            .out_of_area_cities
            .iter()
            .filter_map(|city| {
                let city = city.trim().to_lowercase();
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&city)))
                    .ok()
                    .map(|re| (city, re))
            })
            .collect();

        Self {
            coverage_markers: marker_pattern(&config.coverage_markers),
            out_of_area_cities,
            keywords: config.escalation_keywords.clone(),
            insurer_name: config.insurer_name.clone(),
            insurer_hotline: config.insurer_hotline.clone(),
            insurer_website: config.insurer_website.clone(),
        }
    }

    pub fn check_incident(&self, kind: IncidentType) -> (bool, String) {
        if kind.requires_escalation() {
            return (
                true,
                format!("La incidencia '{}' requiere gestión de la EPS", kind.display_name()),
            );
        }
        (false, String::new())
    }

    pub fn check_coverage(&self, address: &str) -> (bool, String) {
        let lower = address.to_lowercase();
        if lower.trim().is_empty() {
            return (false, String::new());
        }
        if self.coverage_markers.as_ref().is_some_and(|re| re.is_match(&lower)) {
            return (true, format!("Zona rural fuera de cobertura: {}", address.trim()));
        }
        if let Some((city, _)) = self.out_of_area_cities.iter().find(|(_, re)| re.is_match(&lower)) {
            return (true, format!("Ciudad fuera del área de operación: {city}"));
        }
        (false, String::new())
    }

    pub fn check_service_type(&self, express_requested: bool) -> (bool, String) {
        if express_requested {
            return (
                true,
                format!(
                    "El servicio expreso no está disponible; debe gestionarse con la EPS {}",
                    self.insurer_name
                ),
            );
        }
        (false, String::new())
    }

    /// Only a known absence escalates; unknown authorization does not.
    pub fn check_authorization(&self, has_authorization: Option<bool>) -> (bool, String) {
        if has_authorization == Some(false) {
            return (
                true,
                format!("El servicio no cuenta con autorización de la EPS {}", self.insurer_name),
            );
        }
        (false, String::new())
    }

    pub fn check_message(&self, message: &str) -> (bool, String) {
        let lower = message.to_lowercase();
        match self.keywords.iter().find(|k| lower.contains(k.as_str())) {
            Some(keyword) => (
                true,
                format!("La solicitud excede el alcance operativo ('{keyword}')"),
            ),
            None => (false, String::new()),
        }
    }

    /// Run every applicable check and combine the results.
    pub fn check_escalation_needed(&self, input: &EscalationInput<'_>) -> EscalationDecision {
        let mut results = Vec::new();
        if let Some(kind) = input.incident_type {
            results.push(self.check_incident(kind));
        }
        for address in [input.pickup_address, input.destination_address].into_iter().flatten() {
            results.push(self.check_coverage(address));
        }
        results.push(self.check_service_type(input.express_requested));
        results.push(self.check_authorization(input.has_authorization));
        if let Some(message) = input.user_message {
            results.push(self.check_message(message));
        }

        let reasons: Vec<String> = results
            .into_iter()
            .filter(|(escalate, _)| *escalate)
            .map(|(_, reason)| reason)
            .collect();

        EscalationDecision {
            escalate: !reasons.is_empty(),
            reasons,
        }
    }

    /// Caller-facing text explaining where to take the request.
    pub fn instructions(&self, reasons: &[String]) -> String {
        let mut text = format!(
            "Entiendo la situación. Esta solicitud debe gestionarse directamente con la EPS {}.",
            self.insurer_name
        );
        if let Some(first) = reasons.first() {
            text.push_str(&format!(" Motivo: {first}."));
        }
        text.push_str(&format!(
            " Puede comunicarse a la línea {} o visitar {}. Un asesor revisará su caso.",
            self.insurer_hotline, self.insurer_website
        ));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> EscalationRules {
        EscalationRules::from_config(&AgentConfig::default())
    }

    #[test]
    fn classify_known_incidents() {
        assert_eq!(IncidentType::classify("el carro no llegó a tiempo"), IncidentType::Lateness);
        assert_eq!(IncidentType::classify("nunca llegaron por mí"), IncidentType::ServiceNotProvided);
        assert_eq!(
            IncidentType::classify("la silla de ruedas no cabe en el carro"),
            IncidentType::NoWheelchairSpace
        );
        assert_eq!(IncidentType::classify("todo bien"), IncidentType::Other);
        assert!(IncidentType::detect("gracias").is_none());
    }

    #[test]
    fn severity_and_auto_escalation() {
        assert_eq!(IncidentType::ServiceNotProvided.severity(), IncidentSeverity::High);
        assert_eq!(IncidentType::Lateness.severity(), IncidentSeverity::Medium);
        assert_eq!(IncidentType::Other.severity(), IncidentSeverity::Low);
        assert!(IncidentType::UserOutOfCity.requires_escalation());
        assert!(!IncidentType::DriverComplaint.requires_escalation());
    }

    #[test]
    fn from_label_falls_back_to_other() {
        assert_eq!(IncidentType::from_label("zone_not_covered"), IncidentType::ZoneNotCovered);
        assert_eq!(IncidentType::from_label("whatever"), IncidentType::Other);
    }

    #[test]
    fn coverage_markers_and_cities() {
        let rules = rules();
        assert!(rules.check_coverage("Vereda El Carmen, finca 3").0);
        assert!(rules.check_coverage("Calle 10 # 4-20, Cali").0);
        // "cali" inside a longer word is not the city
        assert!(!rules.check_coverage("Barrio Calidad, Cra 5").0);
        assert!(!rules.check_coverage("Calle 45 # 12-30").0);
        assert!(!rules.check_coverage("   ").0);
        assert!(rules.check_coverage("Vía a Rionegro Km 12").0);
    }

    #[test]
    fn marker_pattern_ignores_padding_and_blanks() {
        let pattern = marker_pattern(&[" km ".into(), "".into(), "Vereda".into()]).unwrap();
        assert!(pattern.is_match("km 3 vía al mar"));
        assert!(pattern.is_match("VEREDAS del norte"));
        assert!(!pattern.is_match("Calle 45 # 12-30"));
        assert!(marker_pattern(&[]).is_none());
    }

    #[test]
    fn authorization_only_escalates_when_known_missing() {
        let rules = rules();
        assert!(rules.check_authorization(Some(false)).0);
        assert!(!rules.check_authorization(None).0);
        assert!(!rules.check_authorization(Some(true)).0);
    }

    #[test]
    fn check_needed_collects_every_reason() {
        let rules = rules();
        let input = EscalationInput {
            incident_type: Some(IncidentType::ServiceNotProvided),
            pickup_address: Some("Vereda La Esperanza"),
            user_message: Some("Necesito un servicio expreso"),
            ..Default::default()
        };
        let decision = rules.check_escalation_needed(&input);
        assert!(decision.escalate);
        assert_eq!(decision.reasons.len(), 3);
        assert!(decision.reason_text().contains("; "));
    }

    #[test]
    fn quiet_turn_does_not_escalate() {
        let input = EscalationInput {
            user_message: Some("Hola"),
            ..Default::default()
        };
        let decision = rules().check_escalation_needed(&input);
        assert!(!decision.escalate);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn instructions_mention_hotline_and_first_reason() {
        let text = rules().instructions(&["Zona rural".to_string()]);
        assert!(text.contains("018000-123456"));
        assert!(text.contains("Motivo: Zona rural."));
    }
}
