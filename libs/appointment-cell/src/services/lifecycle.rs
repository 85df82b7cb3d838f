// libs/appointment-cell/src/services/lifecycle.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notification_cell::{NotificationCode, NotificationEmitter};

use crate::models::{
    Actor, ActorRole, Appointment, AppointmentError, AppointmentMode, AppointmentPolicy,
    AppointmentStatus, BookAppointmentRequest, CancelledBy, JoinResolution,
};
use crate::services::store::{
    AppointmentFilter, AppointmentPatch, AppointmentStore, PartyRole,
};
use crate::services::visio::VisioSessionResolver;
use crate::services::window::{
    can_join, has_window_closed, minutes_until_window_opens, JoinWindowConfig,
};

/// Drives every appointment status transition: validates the actor and
/// the current state, applies the write through the store's
/// compare-and-swap, and emits the resulting notification. The loser of
/// a concurrent write observes `Conflict` and must re-fetch; nothing is
/// retried internally.
pub struct AppointmentLifecycleService {
    store: Arc<dyn AppointmentStore>,
    emitter: Arc<dyn NotificationEmitter>,
    visio: VisioSessionResolver,
    policy: AppointmentPolicy,
    window: JoinWindowConfig,
}

impl AppointmentLifecycleService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        emitter: Arc<dyn NotificationEmitter>,
        visio: VisioSessionResolver,
    ) -> Self {
        Self {
            store,
            emitter,
            visio,
            policy: AppointmentPolicy::default(),
            window: JoinWindowConfig::default(),
        }
    }

    // ==========================================================================
    // OPERATIONS
    // ==========================================================================

    /// Patient-initiated booking request. Creates the record in `pending`
    /// and informs the nutritionist.
    pub async fn book(
        &self,
        request: BookAppointmentRequest,
        actor: Actor,
    ) -> Result<Appointment, AppointmentError> {
        if actor.id != request.patient_id {
            return Err(AppointmentError::Unauthorized);
        }

        let appointment = self.store.create(&request).await?;

        info!(
            "Appointment {} requested by patient {} with nutritionist {}",
            appointment.id, appointment.patient_id, appointment.nutritionist_id
        );

        self.notify(
            appointment.nutritionist_id,
            NotificationCode::AppointmentRequested,
            json!({
                "appointment_id": appointment.id,
                "scheduled_at": appointment.scheduled_at,
                "patient_message": appointment.patient_message,
            }),
        );

        Ok(appointment)
    }

    /// Parties see their own appointments; the system actor (admin or
    /// internal sweep) may read any record.
    pub async fn get(&self, id: Uuid, actor: Actor) -> Result<Appointment, AppointmentError> {
        let appointment = self.store.get_by_id(id).await?;
        self.authorize_reader(&appointment, actor)?;
        Ok(appointment)
    }

    pub async fn list_for_actor(
        &self,
        actor: Actor,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        // Listing is party-scoped; the system actor has no party column
        let role = match actor.role {
            ActorRole::Patient => PartyRole::Patient,
            ActorRole::Nutritionist => PartyRole::Nutritionist,
            ActorRole::System => return Err(AppointmentError::Unauthorized),
        };
        self.store.list_for_party(actor.id, role, filter).await
    }

    /// Earliest future appointment that can still happen for the party.
    pub async fn next_appointment(
        &self,
        actor: Actor,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let mut filter = AppointmentFilter::upcoming(Utc::now());
        filter.limit = Some(1);
        let mut upcoming = self.list_for_actor(actor, &filter).await?;
        Ok(if upcoming.is_empty() {
            None
        } else {
            Some(upcoming.remove(0))
        })
    }

    /// pending -> confirmed, by the nutritionist.
    pub async fn confirm(&self, id: Uuid, actor: Actor) -> Result<Appointment, AppointmentError> {
        let appointment = self.store.get_by_id(id).await?;
        self.authorize_nutritionist(&appointment, actor)?;
        self.ensure_status(&appointment, &[AppointmentStatus::Pending])?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Confirmed),
            ..Default::default()
        };
        let confirmed = self
            .store
            .update(appointment.id, appointment.updated_at, &patch)
            .await?;

        info!("Appointment {} confirmed", confirmed.id);

        self.notify(
            confirmed.patient_id,
            NotificationCode::AppointmentConfirmed,
            json!({
                "appointment_id": confirmed.id,
                "scheduled_at": confirmed.scheduled_at,
            }),
        );

        Ok(confirmed)
    }

    /// pending -> declined, by the nutritionist, with a mandatory reason.
    pub async fn decline(
        &self,
        id: Uuid,
        actor: Actor,
        reason: &str,
    ) -> Result<Appointment, AppointmentError> {
        let reason = self.validate_reason(reason)?;

        let appointment = self.store.get_by_id(id).await?;
        self.authorize_nutritionist(&appointment, actor)?;
        self.ensure_status(&appointment, &[AppointmentStatus::Pending])?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Declined),
            decline_reason: Some(reason.clone()),
            ..Default::default()
        };
        let declined = self
            .store
            .update(appointment.id, appointment.updated_at, &patch)
            .await?;

        info!("Appointment {} declined", declined.id);

        self.notify(
            declined.patient_id,
            NotificationCode::AppointmentCancelled,
            json!({
                "appointment_id": declined.id,
                "scheduled_at": declined.scheduled_at,
                "reason": reason,
            }),
        );

        Ok(declined)
    }

    /// Moves a pending request to a new slot. Status stays `pending`; the
    /// patient is informed of the new time.
    pub async fn reschedule(
        &self,
        id: Uuid,
        actor: Actor,
        new_scheduled_at: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        if new_scheduled_at <= Utc::now() {
            return Err(AppointmentError::ValidationError(
                "Appointment must be rescheduled to a future time".to_string(),
            ));
        }

        let appointment = self.store.get_by_id(id).await?;
        self.authorize_nutritionist(&appointment, actor)?;
        self.ensure_status(&appointment, &[AppointmentStatus::Pending])?;

        let patch = AppointmentPatch {
            scheduled_at: Some(new_scheduled_at),
            ..Default::default()
        };
        let rescheduled = self
            .store
            .update(appointment.id, appointment.updated_at, &patch)
            .await?;

        info!(
            "Appointment {} rescheduled to {}",
            rescheduled.id, new_scheduled_at
        );

        self.notify(
            rescheduled.patient_id,
            NotificationCode::AppointmentRescheduled,
            json!({
                "appointment_id": rescheduled.id,
                "scheduled_at": rescheduled.scheduled_at,
            }),
        );

        Ok(rescheduled)
    }

    /// {pending, confirmed} -> cancelled, by either party. The reason is
    /// optional for the patient, mandatory for the nutritionist.
    pub async fn cancel(
        &self,
        id: Uuid,
        actor: Actor,
        reason: Option<&str>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.store.get_by_id(id).await?;
        self.ensure_is_party(&appointment, actor)?;
        self.ensure_status(
            &appointment,
            &[AppointmentStatus::Pending, AppointmentStatus::Confirmed],
        )?;

        let cancelled_by = if actor.id == appointment.patient_id {
            CancelledBy::Patient
        } else {
            CancelledBy::Nutritionist
        };

        let reason = match reason {
            Some(text) => Some(self.validate_reason(text)?),
            None if cancelled_by == CancelledBy::Nutritionist => {
                return Err(AppointmentError::ValidationError(
                    "A cancellation reason is required".to_string(),
                ));
            }
            None => None,
        };

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Cancelled),
            cancelled_by: Some(cancelled_by),
            cancellation_reason: reason.clone(),
            ..Default::default()
        };
        let cancelled = self
            .store
            .update(appointment.id, appointment.updated_at, &patch)
            .await?;

        info!("Appointment {} cancelled by {:?}", cancelled.id, cancelled_by);

        self.notify(
            cancelled.other_party(actor.id),
            NotificationCode::AppointmentCancelled,
            json!({
                "appointment_id": cancelled.id,
                "scheduled_at": cancelled.scheduled_at,
                "reason": reason,
            }),
        );

        Ok(cancelled)
    }

    /// confirmed -> completed, once the scheduled slot has ended. Run by
    /// the nutritionist or by a system sweep.
    pub async fn complete(
        &self,
        id: Uuid,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.store.get_by_id(id).await?;
        if actor.role != ActorRole::System {
            self.authorize_nutritionist(&appointment, actor)?;
        }
        self.ensure_status(&appointment, &[AppointmentStatus::Confirmed])?;

        if now <= appointment.scheduled_end_at() {
            return Err(AppointmentError::ValidationError(
                "Appointment has not ended yet".to_string(),
            ));
        }

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Completed),
            ..Default::default()
        };
        let completed = self
            .store
            .update(appointment.id, appointment.updated_at, &patch)
            .await?;

        info!("Appointment {} completed", completed.id);
        Ok(completed)
    }

    /// Gate a visio join attempt through the time window, materializing
    /// the room lazily on the first attempt that falls inside it.
    pub async fn resolve_join(
        &self,
        id: Uuid,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<JoinResolution, AppointmentError> {
        let appointment = self.store.get_by_id(id).await?;
        self.ensure_is_party(&appointment, actor)?;

        if appointment.mode != AppointmentMode::Remote {
            return Err(AppointmentError::InvalidMode(appointment.mode));
        }

        // A terminal appointment never mints a room, even if the clock
        // still falls inside what was its join window.
        self.ensure_status(
            &appointment,
            &[AppointmentStatus::Pending, AppointmentStatus::Confirmed],
        )?;

        let scheduled_end_at = appointment.scheduled_end_at();

        if !can_join(&self.window, now, appointment.scheduled_at, scheduled_end_at) {
            let reason = if has_window_closed(&self.window, now, scheduled_end_at) {
                "The join window for this appointment has closed".to_string()
            } else {
                let minutes = minutes_until_window_opens(&self.window, now, appointment.scheduled_at);
                format!(
                    "The join window opens in {}h {:02}m",
                    minutes / 60,
                    minutes % 60
                )
            };

            debug!("Join blocked for appointment {}: {}", appointment.id, reason);

            return Ok(JoinResolution {
                can_join: false,
                join_link: None,
                room_id: None,
                reason_if_blocked: Some(reason),
            });
        }

        let (join_link, room_id) = self.visio.resolve(self.store.as_ref(), &appointment).await?;

        Ok(JoinResolution {
            can_join: true,
            join_link: Some(join_link),
            room_id: Some(room_id),
            reason_if_blocked: None,
        })
    }

    // ==========================================================================
    // GUARDS AND HELPERS
    // ==========================================================================

    fn ensure_status(
        &self,
        appointment: &Appointment,
        allowed: &[AppointmentStatus],
    ) -> Result<(), AppointmentError> {
        if !allowed.contains(&appointment.status) {
            warn!(
                "Invalid transition attempted on appointment {} from {}",
                appointment.id, appointment.status
            );
            return Err(AppointmentError::InvalidTransition(appointment.status));
        }
        Ok(())
    }

    /// Read access: either party, or the system actor.
    fn authorize_reader(&self, appointment: &Appointment, actor: Actor) -> Result<(), AppointmentError> {
        if actor.role == ActorRole::System || appointment.is_party(actor.id) {
            return Ok(());
        }
        Err(AppointmentError::Unauthorized)
    }

    /// Mutations initiated by a party: no system bypass.
    fn ensure_is_party(&self, appointment: &Appointment, actor: Actor) -> Result<(), AppointmentError> {
        if appointment.is_party(actor.id) {
            return Ok(());
        }
        Err(AppointmentError::Unauthorized)
    }

    fn authorize_nutritionist(
        &self,
        appointment: &Appointment,
        actor: Actor,
    ) -> Result<(), AppointmentError> {
        match actor.role {
            ActorRole::Nutritionist if actor.id == appointment.nutritionist_id => Ok(()),
            _ => Err(AppointmentError::Unauthorized),
        }
    }

    fn validate_reason(&self, reason: &str) -> Result<String, AppointmentError> {
        let trimmed = reason.trim();
        if trimmed.chars().count() < self.policy.min_reason_chars {
            return Err(AppointmentError::ValidationError(format!(
                "Reason must be at least {} characters",
                self.policy.min_reason_chars
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Notification delivery is best-effort: a failed emit is logged and
    /// never rolls back the transition that triggered it.
    fn notify(&self, recipient_id: Uuid, code: NotificationCode, data: serde_json::Value) {
        let emitter = Arc::clone(&self.emitter);
        tokio::spawn(async move {
            if let Err(e) = emitter.notify(recipient_id, code, data).await {
                warn!("Notification delivery failed ({}): {}", code, e);
            }
        });
    }
}
