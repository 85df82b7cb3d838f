// libs/notification-cell/src/models.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Templated notification codes understood by the NutriSensia frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCode {
    AppointmentRequested,
    AppointmentConfirmed,
    AppointmentCancelled,
    AppointmentRescheduled,
}

impl fmt::Display for NotificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationCode::AppointmentRequested => write!(f, "appointment_requested"),
            NotificationCode::AppointmentConfirmed => write!(f, "appointment_confirmed"),
            NotificationCode::AppointmentCancelled => write!(f, "appointment_cancelled"),
            NotificationCode::AppointmentRescheduled => write!(f, "appointment_rescheduled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}
