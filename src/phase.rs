//! Conversation phase state machine.
//!
//! Two disjoint flows share a single terminal phase:
//!
//! - inbound: Greeting → Identification → LegalNotice → ServiceCoordination
//!   ⇄ IncidentManagement → Escalation → Closing → Survey → End
//! - outbound: OutboundGreeting → OutboundLegalNotice →
//!   OutboundServiceConfirmation ⇄ OutboundSpecialCases → OutboundClosing → End
//!
//! The model proposes the next phase every turn; [`Phase::resolve`] decides
//! whether that proposal is honored.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Who started the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inbound => "INBOUND",
            Self::Outbound => "OUTBOUND",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CallDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(Self::Inbound),
            "OUTBOUND" => Ok(Self::Outbound),
            other => Err(format!("unknown call direction: {other}")),
        }
    }
}

/// A named stage of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Greeting,
    Identification,
    LegalNotice,
    ServiceCoordination,
    IncidentManagement,
    Escalation,
    Closing,
    Survey,
    OutboundGreeting,
    OutboundLegalNotice,
    OutboundServiceConfirmation,
    OutboundSpecialCases,
    OutboundClosing,
    End,
}

impl Phase {
    /// Every phase, in flow order (inbound first, then outbound, then `End`).
    pub const ALL: [Phase; 14] = [
        Phase::Greeting,
        Phase::Identification,
        Phase::LegalNotice,
        Phase::ServiceCoordination,
        Phase::IncidentManagement,
        Phase::Escalation,
        Phase::Closing,
        Phase::Survey,
        Phase::OutboundGreeting,
        Phase::OutboundLegalNotice,
        Phase::OutboundServiceConfirmation,
        Phase::OutboundSpecialCases,
        Phase::OutboundClosing,
        Phase::End,
    ];

    /// Phases reachable from `self`, excluding the implicit same-phase loop.
    pub fn allowed_next(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Greeting => &[Identification],
            Identification => &[LegalNotice, Escalation],
            LegalNotice => &[ServiceCoordination],
            ServiceCoordination => &[IncidentManagement, Escalation, Closing],
            IncidentManagement => &[ServiceCoordination, Escalation, Closing],
            Escalation => &[Closing],
            Closing => &[Survey],
            Survey => &[End],
            OutboundGreeting => &[OutboundLegalNotice],
            OutboundLegalNotice => &[OutboundServiceConfirmation, OutboundSpecialCases],
            OutboundServiceConfirmation => &[OutboundSpecialCases, OutboundClosing],
            OutboundSpecialCases => &[OutboundServiceConfirmation, OutboundClosing],
            OutboundClosing => &[End],
            End => &[],
        }
    }

    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Staying in the same phase is always valid.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        *self == target || self.allowed_next().contains(&target)
    }

    /// Guard a proposed transition: the proposal if reachable, else `current`.
    pub fn resolve(current: Phase, proposed: Phase) -> Phase {
        if current.can_transition_to(proposed) {
            proposed
        } else {
            current
        }
    }

    /// Shortest chain of legal steps from `self` to `target`, excluding
    /// `self`. Empty when already there, `None` when unreachable.
    pub fn route_to(&self, target: Phase) -> Option<Vec<Phase>> {
        let mut previous: HashMap<Phase, Phase> = HashMap::new();
        let mut queue = VecDeque::from([*self]);
        while let Some(phase) = queue.pop_front() {
            if phase == target {
                let mut route = vec![phase];
                let mut at = phase;
                while let Some(&before) = previous.get(&at) {
                    route.push(before);
                    at = before;
                }
                route.pop();
                route.reverse();
                return Some(route);
            }
            for &next in phase.allowed_next() {
                if next != *self && !previous.contains_key(&next) {
                    previous.insert(next, phase);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Whether this phase ends the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }

    /// First phase of a call in the given direction.
    pub fn initial(direction: CallDirection) -> Phase {
        match direction {
            CallDirection::Inbound => Self::Greeting,
            CallDirection::Outbound => Self::OutboundGreeting,
        }
    }

    /// The flow this phase belongs to. `End` is shared by both.
    pub fn direction(&self) -> Option<CallDirection> {
        use Phase::*;
        match self {
            Greeting | Identification | LegalNotice | ServiceCoordination | IncidentManagement
            | Escalation | Closing | Survey => Some(CallDirection::Inbound),
            OutboundGreeting
            | OutboundLegalNotice
            | OutboundServiceConfirmation
            | OutboundSpecialCases
            | OutboundClosing => Some(CallDirection::Outbound),
            End => None,
        }
    }

    /// Spanish label used when briefing the model.
    pub fn display_name(&self) -> &'static str {
        use Phase::*;
        match self {
            Greeting => "Saludo",
            Identification => "Identificación",
            LegalNotice => "Aviso legal",
            ServiceCoordination => "Coordinación de servicio",
            IncidentManagement => "Gestión de incidencias",
            Escalation => "Escalamiento",
            Closing => "Cierre",
            Survey => "Encuesta",
            OutboundGreeting => "Saludo (saliente)",
            OutboundLegalNotice => "Aviso legal (saliente)",
            OutboundServiceConfirmation => "Confirmación de servicio",
            OutboundSpecialCases => "Casos especiales",
            OutboundClosing => "Cierre (saliente)",
            End => "Fin",
        }
    }

    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        use Phase::*;
        match self {
            Greeting => "GREETING",
            Identification => "IDENTIFICATION",
            LegalNotice => "LEGAL_NOTICE",
            ServiceCoordination => "SERVICE_COORDINATION",
            IncidentManagement => "INCIDENT_MANAGEMENT",
            Escalation => "ESCALATION",
            Closing => "CLOSING",
            Survey => "SURVEY",
            OutboundGreeting => "OUTBOUND_GREETING",
            OutboundLegalNotice => "OUTBOUND_LEGAL_NOTICE",
            OutboundServiceConfirmation => "OUTBOUND_SERVICE_CONFIRMATION",
            OutboundSpecialCases => "OUTBOUND_SPECIAL_CASES",
            OutboundClosing => "OUTBOUND_CLOSING",
            End => "END",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}
