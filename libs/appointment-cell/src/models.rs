// libs/appointment-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub nutritionist_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub consultation_type_code: String,
    pub mode: AppointmentMode,
    pub status: AppointmentStatus,
    pub join_link: Option<String>,
    pub room_id: Option<String>,
    pub patient_message: Option<String>,
    pub cancelled_by: CancelledBy,
    pub cancellation_reason: Option<String>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// End of the scheduled slot. Always derived from `scheduled_at` and
    /// `duration_minutes`, never stored or mutated independently.
    pub fn scheduled_end_at(&self) -> DateTime<Utc> {
        self.scheduled_at + chrono::Duration::minutes(self.duration_minutes as i64)
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.patient_id == user_id || self.nutritionist_id == user_id
    }

    /// The party on the other side of the appointment from `user_id`.
    pub fn other_party(&self, user_id: Uuid) -> Uuid {
        if self.patient_id == user_id {
            self.nutritionist_id
        } else {
            self.patient_id
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Declined,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Declined
                | AppointmentStatus::Cancelled
                | AppointmentStatus::Completed
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Pending => write!(f, "pending"),
            AppointmentStatus::Confirmed => write!(f, "confirmed"),
            AppointmentStatus::Declined => write!(f, "declined"),
            AppointmentStatus::Cancelled => write!(f, "cancelled"),
            AppointmentStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentMode {
    InPerson,
    Remote,
}

impl fmt::Display for AppointmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentMode::InPerson => write!(f, "in_person"),
            AppointmentMode::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Patient,
    Nutritionist,
    None,
}

// ==============================================================================
// ACTORS
// ==============================================================================

/// Authenticated principal attempting a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Patient,
    Nutritionist,
    /// Internal callers (auto-completion sweeps). Bypasses party checks.
    System,
}

impl Actor {
    pub fn patient(id: Uuid) -> Self {
        Self { id, role: ActorRole::Patient }
    }

    pub fn nutritionist(id: Uuid) -> Self {
        Self { id, role: ActorRole::Nutritionist }
    }

    pub fn system() -> Self {
        Self { id: Uuid::nil(), role: ActorRole::System }
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub patient_id: Uuid,
    pub nutritionist_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub mode: AppointmentMode,
    pub consultation_type_code: String,
    pub patient_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclineAppointmentRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub new_scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: Option<String>,
}

/// Outcome of a join attempt against the visio join window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResolution {
    pub can_join: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_if_blocked: Option<String>,
}

// ==============================================================================
// VALIDATION RULES
// ==============================================================================

/// Business rules applied by the lifecycle service. Values mirror the
/// product decisions baked into the NutriSensia frontend.
#[derive(Debug, Clone)]
pub struct AppointmentPolicy {
    pub min_reason_chars: usize,
}

impl Default for AppointmentPolicy {
    fn default() -> Self {
        Self { min_reason_chars: 5 }
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Not authorized for this appointment")]
    Unauthorized,

    #[error("Appointment cannot be modified in current status: {0}")]
    InvalidTransition(AppointmentStatus),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Appointment was modified concurrently")]
    Conflict,

    #[error("Visio session requested for a {0} appointment")]
    InvalidMode(AppointmentMode),

    #[error("Database error: {0}")]
    DatabaseError(String),
}
