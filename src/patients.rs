//! Patient data provider: the scheduled-trip records outbound calls confirm.
//!
//! The production source is a spreadsheet owned by the agency; the crate only
//! depends on the [`PatientDirectory`] trait. [`InMemoryPatientDirectory`]
//! backs tests and the local REPL, optionally seeded from a JSON file.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::PatientDataError;
use crate::session::SessionState;

/// Status written back after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallStatus {
    #[default]
    #[serde(rename = "Pendiente")]
    Pending,
    #[serde(rename = "Confirmado")]
    Confirmed,
    #[serde(rename = "Reprogramar")]
    Reschedule,
    #[serde(rename = "Rechazado")]
    Rejected,
    #[serde(rename = "No contesta")]
    NoAnswer,
    #[serde(rename = "Zona sin cobertura")]
    NoCoverage,
}

impl CallStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pendiente",
            Self::Confirmed => "Confirmado",
            Self::Reschedule => "Reprogramar",
            Self::Rejected => "Rechazado",
            Self::NoAnswer => "No contesta",
            Self::NoCoverage => "Zona sin cobertura",
        }
    }

    /// Parse a label loosely (case and accents as the model tends to write
    /// them), defaulting to `Pending`.
    pub fn from_label(label: &str) -> CallStatus {
        let lower = label.trim().to_lowercase();
        match lower.as_str() {
            "confirmado" | "confirmed" => Self::Confirmed,
            "reprogramar" | "reprogramado" | "reschedule" => Self::Reschedule,
            "rechazado" | "rejected" | "cancelado" => Self::Rejected,
            "no contesta" | "no_contesta" | "no answer" => Self::NoAnswer,
            "zona sin cobertura" | "sin cobertura" | "no_coverage" => Self::NoCoverage,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One scheduled trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Position in the source table; assigned on load.
    #[serde(default)]
    pub row: usize,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub document_type: String,
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub insurer: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub city: String,
    pub phone: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_relationship: Option<String>,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub treatment_type: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub appointment_date: String,
    #[serde(default)]
    pub appointment_time: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub modality: String,
    #[serde(default)]
    pub pickup_zone: Option<String>,
    #[serde(default)]
    pub pickup_address: String,
    #[serde(default)]
    pub special_observations: Option<String>,
    #[serde(default)]
    pub status: CallStatus,
    /// Timestamped notes from previous calls, oldest first.
    #[serde(default)]
    pub observations: Vec<String>,
}

impl PatientRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Copy what the record knows into a fresh outbound session.
    pub fn apply_to(&self, state: &mut SessionState) {
        fn opt(s: &str) -> Option<String> {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }

        let p = &mut state.patient;
        p.full_name = opt(&self.full_name());
        p.document_type = opt(&self.document_type);
        p.document_number = opt(&self.document_number);
        p.insurer = opt(&self.insurer);
        p.phone = normalize_phone(&self.phone);
        p.contact_name = self.contact_name.clone();
        p.contact_relationship = self.contact_relationship.clone();

        let s = &mut state.service;
        s.service_type = opt(&self.service_type);
        s.treatment_type = self.treatment_type.clone();
        s.frequency = self.frequency.clone();
        s.appointment_date = opt(&self.appointment_date);
        s.appointment_time = opt(&self.appointment_time);
        s.destination_address = opt(&self.destination);
        s.modality = opt(&self.modality);
        s.pickup_address = opt(&self.pickup_address);
        s.special_observations = self.special_observations.clone();

        state.patient_row = Some(self.row);
    }
}

/// Reduce a phone number to its 10 local digits.
///
/// Handles spreadsheet artifacts (`3001234567.0`), separators and a leading
/// `57` country code. Returns `None` when what is left is not 10 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let local = match digits.len() {
        12 if digits.starts_with("57") => digits[2..].to_string(),
        _ => digits,
    };
    (local.len() == 10).then_some(local)
}

/// Read/update access to scheduled-trip records.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn get_patient_by_phone(&self, phone: &str)
    -> Result<Option<PatientRecord>, PatientDataError>;

    async fn update_call_status(
        &self,
        row: usize,
        status: CallStatus,
        observations: &str,
    ) -> Result<(), PatientDataError>;
}

/// Patient records held in memory.
pub struct InMemoryPatientDirectory {
    records: RwLock<Vec<PatientRecord>>,
}

impl InMemoryPatientDirectory {
    /// Row references are reassigned to match the vector position.
    pub fn new(mut records: Vec<PatientRecord>) -> Self {
        for (row, record) in records.iter_mut().enumerate() {
            record.row = row;
        }
        Self {
            records: RwLock::new(records),
        }
    }

    /// Load a JSON array of records.
    pub fn from_json_file(path: &Path) -> Result<Self, PatientDataError> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<PatientRecord> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), count = records.len(), "Patient records loaded");
        Ok(Self::new(records))
    }

    /// Snapshot of one record.
    pub async fn record(&self, row: usize) -> Option<PatientRecord> {
        self.records.read().await.get(row).cloned()
    }
}

#[async_trait]
impl PatientDirectory for InMemoryPatientDirectory {
    async fn get_patient_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<PatientRecord>, PatientDataError> {
        let Some(wanted) = normalize_phone(phone) else {
            warn!(phone = %phone, "Phone number is not a valid 10-digit number");
            return Ok(None);
        };
        let records = self.records.read().await;
        Ok(records
            .iter()
            .find(|r| normalize_phone(&r.phone).as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    async fn update_call_status(
        &self,
        row: usize,
        status: CallStatus,
        observations: &str,
    ) -> Result<(), PatientDataError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(row)
            .ok_or(PatientDataError::RowNotFound { row })?;
        record.status = status;
        if !observations.trim().is_empty() {
            let stamp = Utc::now().format("%Y-%m-%d %H:%M");
            record.observations.push(format!("[{stamp}] {}", observations.trim()));
        }
        info!(row, status = %status, "Call status updated");
        Ok(())
    }
}
