//! Prompt text: system prompt assembly, phase briefs and greetings.

use chrono::{Datelike, NaiveDate, Weekday};
use serde_json::{Map, Value};

use crate::phase::{CallDirection, Phase};
use crate::pipeline::types::Enrichment;
use crate::policy::PolicyEvaluation;
use crate::session::{PatientInfo, SessionState, non_empty_text};

const WEEKDAYS: [&str; 7] = [
    "lunes",
    "martes",
    "miércoles",
    "jueves",
    "viernes",
    "sábado",
    "domingo",
];

const MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// Relationship words that suggest the person on the line may be a minor.
const MINOR_RELATIONSHIPS: [&str; 5] = ["hijo", "hija", "nieto", "nieta", "menor"];

/// Time-of-day greeting for a local hour (0-23).
pub fn greeting_for_hour(hour: u32) -> &'static str {
    match hour {
        6..=11 => "Buenos días",
        12..=18 => "Buenas tardes",
        _ => "Buenas noches",
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    WEEKDAYS[day.num_days_from_monday() as usize]
}

/// Parse a date in any of the formats the schedules use.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Spoken form of a date relative to `today`, e.g. "martes 21 de octubre (mañana)".
///
/// Unparseable input is returned trimmed, unchanged.
pub fn describe_date(raw: &str, today: NaiveDate) -> String {
    let Some(date) = parse_date(raw) else {
        return raw.trim().to_string();
    };
    let base = format!(
        "{} {} de {}",
        weekday_name(date.weekday()),
        date.day(),
        MONTHS[date.month0() as usize]
    );
    let relative = match (date - today).num_days() {
        0 => Some("hoy".to_string()),
        1 => Some("mañana".to_string()),
        n @ 2..=7 => Some(format!("en {n} días")),
        _ => None,
    };
    match relative {
        Some(r) => format!("{base} ({r})"),
        None => base,
    }
}

/// The first date of a possibly comma-separated schedule.
fn first_scheduled_date(raw: &str) -> Option<&str> {
    raw.split(',').map(str::trim).find(|d| !d.is_empty())
}

/// Opening line of an outbound call, built from the loaded patient record.
pub fn outbound_greeting(state: &SessionState, hour: u32, today: NaiveDate) -> String {
    let name = state
        .patient
        .full_name
        .as_deref()
        .unwrap_or("el paciente");
    let mut text = format!(
        "{}, ¿tengo el gusto de hablar con {}? Le habla {} de {}, en nombre de la EPS {}.",
        greeting_for_hour(hour),
        name,
        state.agent_name,
        state.company_name,
        state.insurer_name
    );

    let service = state
        .service
        .service_type
        .as_deref()
        .unwrap_or("su servicio");
    let date = state
        .service
        .appointment_date
        .as_deref()
        .and_then(first_scheduled_date)
        .map(|d| describe_date(d, today));
    match (date, state.service.appointment_time.as_deref()) {
        (Some(date), Some(time)) => text.push_str(&format!(
            " Le llamo para confirmar el transporte de {service} programado para el {date} a las {time}."
        )),
        (Some(date), None) => text.push_str(&format!(
            " Le llamo para confirmar el transporte de {service} programado para el {date}."
        )),
        _ => text.push_str(&format!(" Le llamo para confirmar el transporte de {service}.")),
    }
    text
}

/// What the model should accomplish in each phase.
pub fn phase_instructions(phase: Phase, insurer: &str) -> String {
    use Phase::*;
    match phase {
        Greeting => "Saluda según la hora, preséntate con tu nombre y la empresa, y pregunta \
                     si hablas con el paciente o con un familiar. Luego pasa a IDENTIFICATION."
            .to_string(),
        Identification => format!(
            "Identifica al paciente: nombre completo, tipo y número de documento, EPS y si \
             quien llama es el paciente o su responsable. Pregunta solo lo que falte. Si la EPS \
             no es {insurer}, marca requires_escalation. Con los datos completos pasa a LEGAL_NOTICE."
        ),
        LegalNotice => "Informa que la llamada está siendo grabada y monitoreada con fines de \
                        calidad. Con cualquier respuesta afirmativa pasa a SERVICE_COORDINATION."
            .to_string(),
        ServiceCoordination => "Coordina el transporte: tipo de servicio, fecha, hora, dirección \
                                de recogida y destino. Si el usuario reporta una queja pasa a \
                                INCIDENT_MANAGEMENT. Con los datos mínimos pasa a CLOSING."
            .to_string(),
        IncidentManagement => "Registra la queja con detalle en extracted.incident_summary, \
                               muestra empatía y no prometas soluciones que no dependen de ti. \
                               Luego vuelve a SERVICE_COORDINATION o pasa a CLOSING."
            .to_string(),
        Escalation => format!(
            "El caso debe gestionarlo la EPS {insurer}. Explica el motivo con amabilidad y \
             pasa a CLOSING."
        ),
        Closing => "Resume lo acordado, pregunta si necesita algo más y pasa a SURVEY.".to_string(),
        Survey => "Pide una calificación de 1 a 5 del servicio, agradece y pasa a END.".to_string(),
        OutboundGreeting => "Confirma que hablas con el paciente o con un familiar autorizado. \
                             Si es otra persona, registra contact_name, contact_relationship y \
                             contact_age. Luego pasa a OUTBOUND_LEGAL_NOTICE."
            .to_string(),
        OutboundLegalNotice => "Informa que la llamada está siendo grabada. Cuando el usuario \
                                acepte pasa a OUTBOUND_SERVICE_CONFIRMATION."
            .to_string(),
        OutboundServiceConfirmation => "Confirma fecha, hora y dirección del servicio programado. \
                                        Registra service_confirmed y confirmation_status. Si hay \
                                        un cambio de fecha, ausencia o problema de cobertura pasa \
                                        a OUTBOUND_SPECIAL_CASES; si todo está confirmado pasa a \
                                        OUTBOUND_CLOSING."
            .to_string(),
        OutboundSpecialCases => "Gestiona la novedad: nueva fecha (new_appointment_date), \
                                 paciente fuera de la ciudad (patient_away, return_date), \
                                 necesidades especiales (special_needs) o zona sin cobertura \
                                 (coverage_issue). Luego vuelve a confirmar o pasa a OUTBOUND_CLOSING."
            .to_string(),
        OutboundClosing => "Agradece, recuerda los datos confirmados y despídete. Pasa a END."
            .to_string(),
        End => "La llamada terminó. Despídete brevemente.".to_string(),
    }
}

fn known(label: &str, value: Option<&str>) -> Option<String> {
    value.map(|v| format!("- {label}: {v}"))
}

/// Bullet list of what is already known about the call.
fn known_data(state: &SessionState) -> Vec<String> {
    let p = &state.patient;
    let s = &state.service;
    [
        known("Paciente", p.full_name.as_deref()),
        known("Documento", p.document_number.as_deref()),
        known("EPS", p.insurer.as_deref()),
        known("Contacto", p.contact_name.as_deref()),
        known("Parentesco", p.contact_relationship.as_deref()),
        known("Servicio", s.service_type.as_deref()),
        known("Fecha", s.appointment_date.as_deref()),
        known("Hora", s.appointment_time.as_deref()),
        known("Recogida", s.pickup_address.as_deref()),
        known("Destino", s.destination_address.as_deref()),
        known("Modalidad", s.modality.as_deref()),
        known("Observaciones", s.special_observations.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Whether the person on the line may be a minor.
pub fn contact_may_be_minor(state: &SessionState) -> bool {
    minor_contact(&state.patient)
}

/// [`contact_may_be_minor`] with contact fields extracted this turn applied
/// on top of the stored ones.
pub fn contact_may_be_minor_with(state: &SessionState, extracted: &Map<String, Value>) -> bool {
    let mut patient = state.patient.clone();
    if let Some(age) = extracted
        .get("contact_age")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
    {
        patient.contact_age = Some(age);
    }
    if let Some(relationship) = extracted.get("contact_relationship").and_then(non_empty_text) {
        patient.contact_relationship = Some(relationship);
    }
    minor_contact(&patient)
}

fn minor_contact(patient: &PatientInfo) -> bool {
    if let Some(age) = patient.contact_age {
        return age < 18;
    }
    patient
        .contact_relationship
        .as_deref()
        .map(|r| {
            let lower = r.to_lowercase();
            MINOR_RELATIONSHIPS.iter().any(|w| lower.contains(w))
        })
        .unwrap_or(false)
}

fn alerts(state: &SessionState) -> Vec<&'static str> {
    let mut alerts = Vec::new();
    if state.direction == CallDirection::Outbound && state.service.appointment_date.is_none() {
        alerts.push("No hay fecha de cita registrada; confírmala con el usuario.");
    }
    if contact_may_be_minor(state) {
        alerts.push(
            "La persona al teléfono podría ser menor de edad: no compartas fechas, horas ni \
             direcciones; pide hablar con un adulto responsable.",
        );
    }
    alerts
}

/// The full system prompt for one model call.
pub fn system_prompt(
    state: &SessionState,
    policy: &PolicyEvaluation,
    enrichment: &Enrichment,
    hour: u32,
    today: NaiveDate,
) -> String {
    let phase = state.current_phase;
    let mut sections = vec![format!(
        "Eres {}, agente de {}, empresa de transporte médico autorizada por la EPS {}. \
         Hablas por teléfono en español, con frases cortas, cálidas y profesionales. \
         Hoy es {} {} de {}; saluda con \"{}\" cuando corresponda.",
        state.agent_name,
        state.company_name,
        state.insurer_name,
        weekday_name(today.weekday()),
        today.day(),
        MONTHS[today.month0() as usize],
        greeting_for_hour(hour),
    )];

    sections.push(format!(
        "FASE ACTUAL: {} ({})\n{}",
        phase,
        phase.display_name(),
        phase_instructions(phase, &state.insurer_name)
    ));

    if !policy.prompt_injection_text.is_empty() {
        sections.push(format!("POLÍTICAS:\n{}", policy.prompt_injection_text));
    }

    let mut guidance = vec![enrichment.tone_instruction.clone()];
    guidance.extend(enrichment.policy_notes.iter().cloned());
    guidance.retain(|g| !g.is_empty());
    if !guidance.is_empty() {
        sections.push(format!("TONO:\n{}", guidance.join("\n")));
    }

    let data = known_data(state);
    if !data.is_empty() {
        sections.push(format!("DATOS CONOCIDOS:\n{}", data.join("\n")));
    }

    let alerts = alerts(state);
    if !alerts.is_empty() {
        sections.push(format!("ALERTAS:\n{}", alerts.join("\n")));
    }

    let next: Vec<&str> = std::iter::once(phase)
        .chain(phase.allowed_next().iter().copied())
        .map(|p| p.as_str())
        .collect();
    sections.push(format!(
        "FORMATO: responde únicamente con un objeto JSON con exactamente estas claves:\n\
         {{\"agent_response\": string, \"next_phase\": string, \"requires_escalation\": bool, \
         \"escalation_reason\": string o null, \"extracted\": objeto}}\n\
         En extracted incluye solo los datos que el usuario dio en este turno \
         (patient_full_name, document_type, document_number, eps, service_type, \
         appointment_date, appointment_time, pickup_address, destination_address, \
         service_modality, incident_summary, service_confirmed, confirmation_status, \
         new_appointment_date, patient_away, return_date, special_needs, coverage_issue, \
         contact_name, contact_relationship, contact_age, wrong_number, patient_deceased, \
         legal_notice_acknowledged, survey_rating).\n\
         Fases válidas para next_phase: {}",
        next.join(", ")
    ));

    sections.join("\n\n")
}
