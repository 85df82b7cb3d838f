// libs/appointment-cell/src/services/visio.rs
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use shared_config::AppConfig;

use crate::models::{Appointment, AppointmentError, AppointmentMode};
use crate::services::store::{AppointmentPatch, AppointmentStore};

/// Materializes the visio room for a remote appointment, lazily on the
/// first successful join attempt. Rooms are never created at booking
/// time so cancelled appointments leave no dead rooms behind.
pub struct VisioSessionResolver {
    base_url: String,
}

impl VisioSessionResolver {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            base_url: config.visio_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Returns `(join_link, room_id)` for the appointment, generating and
    /// persisting them if absent. Idempotent: once materialized, the same
    /// artifacts come back on every call.
    pub async fn resolve(
        &self,
        store: &dyn AppointmentStore,
        appointment: &Appointment,
    ) -> Result<(String, String), AppointmentError> {
        if appointment.mode != AppointmentMode::Remote {
            return Err(AppointmentError::InvalidMode(appointment.mode));
        }

        if let (Some(join_link), Some(room_id)) = (&appointment.join_link, &appointment.room_id) {
            debug!("Visio room already materialized for appointment {}", appointment.id);
            return Ok((join_link.clone(), room_id.clone()));
        }

        let room_id = self.generate_room_id(appointment);
        let join_link = format!("{}/room/{}", self.base_url, room_id);

        let patch = AppointmentPatch {
            join_link: Some(join_link.clone()),
            room_id: Some(room_id.clone()),
            ..Default::default()
        };

        match store.update(appointment.id, appointment.updated_at, &patch).await {
            Ok(updated) => {
                info!("Visio room {} created for appointment {}", room_id, updated.id);
                Ok((join_link, room_id))
            }
            Err(AppointmentError::Conflict) => {
                // Lost the race. If the winner was another join attempt the
                // artifacts now exist, return those to keep resolution
                // idempotent across both participants.
                let current = store.get_by_id(appointment.id).await?;
                match (current.join_link, current.room_id) {
                    (Some(join_link), Some(room_id)) => {
                        debug!(
                            "Concurrent resolver materialized room {} for appointment {}",
                            room_id, appointment.id
                        );
                        Ok((join_link, room_id))
                    }
                    _ => Err(AppointmentError::Conflict),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn generate_room_id(&self, appointment: &Appointment) -> String {
        let prefix: String = appointment.id.simple().to_string().chars().take(8).collect();
        let suffix: u16 = rand::thread_rng().gen_range(0..10000);
        format!("ns_{}_{}_{:04}", prefix, Utc::now().timestamp(), suffix)
    }
}
