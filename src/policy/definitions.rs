//! The standard transport policy set.

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::escalation::marker_pattern;
use crate::phase::Phase;
use crate::policy::{DirectionScope, Finding, PhaseScope, Policy, PolicyCategory, Severity};
use crate::session::SessionState;

const DRIVER_REQUEST_PHRASES: &[&str] = &[
    "quiero al conductor",
    "prefiero al conductor",
    "el mismo conductor",
    "quiero que me lleve",
];

const EXPRESS_PHRASES: &[&str] = &["expreso", "express", "exclusivo"];

/// Policies in declaration order; prompt text is injected in this order.
pub fn default_policies(config: &AgentConfig) -> Vec<Policy> {
    vec![
        driver_assignment(),
        insurer_coverage(&config.insurer_name),
        geographic_coverage(&config.coverage_markers),
        transport_modality(),
        call_protocol(&config.agent_name, &config.company_name),
    ]
}

fn last_user_lower(state: &SessionState) -> Option<String> {
    state.last_user_message().map(str::to_lowercase)
}

fn driver_assignment() -> Policy {
    Policy {
        id: "DRIVER_001".to_string(),
        name: "Asignación de conductor".to_string(),
        category: PolicyCategory::Driver,
        description: "Los conductores se asignan por disponibilidad; no se garantiza uno específico"
            .to_string(),
        severity: Severity::Warning,
        phases: PhaseScope::Any,
        directions: vec![DirectionScope::Both],
        recommended_action: "Explicar que el conductor se asigna según disponibilidad".to_string(),
        response_template: Some(
            "Entiendo su preferencia. Los conductores se asignan según disponibilidad, \
             por eso no puedo garantizarle un conductor específico."
                .to_string(),
        ),
        prompt_injection: "CONDUCTORES: nunca prometas un conductor específico. La asignación \
                           depende de la disponibilidad del día."
            .to_string(),
        predicate: Arc::new(|state| {
            let message = last_user_lower(state)?;
            DRIVER_REQUEST_PHRASES
                .iter()
                .any(|p| message.contains(p))
                .then(|| Finding::new("last_user_message", message))
        }),
    }
}

fn insurer_coverage(accepted: &str) -> Policy {
    let accepted_lower = accepted.trim().to_lowercase();
    Policy {
        id: "INSURER_001".to_string(),
        name: "Cobertura por EPS".to_string(),
        category: PolicyCategory::Insurer,
        description: format!("Solo se atienden afiliados de la EPS {accepted}"),
        severity: Severity::Blocking,
        phases: PhaseScope::Only(vec![Phase::Identification]),
        directions: vec![DirectionScope::Both],
        recommended_action: format!("Remitir al usuario a su EPS; el servicio es exclusivo de {accepted}"),
        response_template: Some(format!(
            "Lo siento, este servicio de transporte es exclusivo para afiliados de la EPS {accepted}. \
             Le recomiendo comunicarse con su EPS."
        )),
        prompt_injection: format!(
            "EPS: verifica que el paciente esté afiliado a {accepted}. Si pertenece a otra EPS, \
             no coordines ningún servicio."
        ),
        predicate: Arc::new(move |state| {
            let insurer = state.patient.insurer.as_deref()?.trim();
            (!insurer.is_empty() && !insurer.to_lowercase().contains(&accepted_lower))
                .then(|| Finding::new("patient.insurer", insurer))
        }),
    }
}

fn geographic_coverage(markers: &[String]) -> Policy {
    let pattern = marker_pattern(markers);
    Policy {
        id: "COVERAGE_001".to_string(),
        name: "Zona de cobertura".to_string(),
        category: PolicyCategory::Coverage,
        description: "Las recogidas en zonas rurales o fuera del perímetro urbano no están cubiertas"
            .to_string(),
        severity: Severity::Blocking,
        phases: PhaseScope::Only(vec![Phase::ServiceCoordination]),
        directions: vec![DirectionScope::Both],
        recommended_action: "Escalar a la EPS para gestionar el transporte desde zona no cubierta"
            .to_string(),
        response_template: None,
        prompt_injection: "COBERTURA: el servicio cubre solo el perímetro urbano. No confirmes \
                           recogidas en veredas, corregimientos o zonas rurales."
            .to_string(),
        predicate: Arc::new(move |state| {
            let address = state.service.pickup_address.as_deref()?;
            pattern
                .as_ref()?
                .is_match(address)
                .then(|| Finding::new("service.pickup_address", address))
        }),
    }
}

fn transport_modality() -> Policy {
    Policy {
        id: "MODALITY_001".to_string(),
        name: "Modalidad de transporte".to_string(),
        category: PolicyCategory::Modality,
        description: "El transporte es compartido; el servicio exclusivo requiere la EPS".to_string(),
        severity: Severity::Warning,
        phases: PhaseScope::Only(vec![Phase::ServiceCoordination]),
        directions: vec![DirectionScope::Both],
        recommended_action: "Aclarar que la modalidad es la autorizada por la EPS".to_string(),
        response_template: None,
        prompt_injection: "MODALIDAD: la modalidad es la que autoriza la EPS. No ofrezcas \
                           servicio expreso ni exclusivo."
            .to_string(),
        predicate: Arc::new(|state| {
            let message = last_user_lower(state)?;
            EXPRESS_PHRASES
                .iter()
                .any(|p| message.contains(p))
                .then(|| Finding::new("last_user_message", message))
        }),
    }
}

fn call_protocol(agent_name: &str, company_name: &str) -> Policy {
    Policy {
        id: "PROTOCOL_001".to_string(),
        name: "Protocolo de saludo".to_string(),
        category: PolicyCategory::Protocol,
        description: "Toda llamada inicia con identificación del agente y la empresa".to_string(),
        severity: Severity::Blocking,
        phases: PhaseScope::Only(vec![Phase::Greeting]),
        directions: vec![DirectionScope::Both],
        recommended_action: "Presentarse con nombre y empresa".to_string(),
        response_template: None,
        prompt_injection: format!(
            "PROTOCOLO: preséntate como {agent_name} de {company_name} e informa que la llamada \
             puede ser grabada."
        ),
        predicate: Arc::new(|_| None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::CallDirection;
    use crate::policy::PolicyEngine;

    fn engine() -> PolicyEngine {
        PolicyEngine::from_config(&AgentConfig::default())
    }

    fn make_state() -> SessionState {
        SessionState::new("s-1", CallDirection::Inbound, "María", "Transformas", "Cosalud")
    }

    #[test]
    fn greeting_applies_driver_and_protocol_only() {
        let mut state = make_state();
        state.append_user("Hola");
        let result = engine().evaluate(&state, Phase::Greeting, CallDirection::Inbound);
        assert_eq!(result.applicable_policy_ids, vec!["DRIVER_001", "PROTOCOL_001"]);
        assert!(result.violations.is_empty());
        assert!(result.prompt_injection_text.contains("María de Transformas"));
    }

    #[test]
    fn foreign_insurer_blocks_in_identification() {
        let mut state = make_state();
        state.patient.insurer = Some("Sanitas".into());
        let result = engine().evaluate(&state, Phase::Identification, CallDirection::Inbound);
        assert!(result.has_blocking());
        assert_eq!(result.violations[0].policy_id, "INSURER_001");
        assert_eq!(result.violations[0].detected_value, "Sanitas");
    }

    #[test]
    fn accepted_insurer_passes_with_prefix() {
        let mut state = make_state();
        state.patient.insurer = Some("EPS Cosalud".into());
        let result = engine().evaluate(&state, Phase::Identification, CallDirection::Inbound);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn rural_pickup_blocks_with_coverage_category() {
        let mut state = make_state();
        state.service.pickup_address = Some("Vereda San José, casa azul".into());
        let result =
            engine().evaluate(&state, Phase::ServiceCoordination, CallDirection::Outbound);
        let violation = result.blocking().next().expect("coverage violation");
        assert_eq!(violation.category, PolicyCategory::Coverage);
        assert_eq!(violation.category.to_string(), "coverage");
    }

    #[test]
    fn express_request_is_a_warning() {
        let mut state = make_state();
        state.append_user("¿Me pueden mandar un carro exclusivo?");
        let result = engine().evaluate(&state, Phase::ServiceCoordination, CallDirection::Inbound);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::Warning);
        assert!(!result.has_blocking());
    }

    #[test]
    fn driver_request_fires_in_any_phase() {
        let mut state = make_state();
        state.append_user("Prefiero al conductor de la semana pasada");
        let result = engine().evaluate(&state, Phase::OutboundSpecialCases, CallDirection::Outbound);
        assert_eq!(result.violations[0].policy_id, "DRIVER_001");
    }
}
