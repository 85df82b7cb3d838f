// libs/appointment-cell/src/services/store.rs
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{
    Appointment, AppointmentError, AppointmentStatus, BookAppointmentRequest, CancelledBy,
};

// ==============================================================================
// QUERY AND PATCH TYPES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Patient,
    Nutritionist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct AppointmentFilter {
    pub statuses: Option<Vec<AppointmentStatus>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<i32>,
}

impl Default for AppointmentFilter {
    fn default() -> Self {
        Self {
            statuses: None,
            from: None,
            to: None,
            order: SortOrder::Descending,
            limit: None,
        }
    }
}

impl AppointmentFilter {
    /// Earliest-first view of appointments that can still happen,
    /// used by the next-appointment query.
    pub fn upcoming(now: DateTime<Utc>) -> Self {
        Self {
            statuses: Some(vec![AppointmentStatus::Pending, AppointmentStatus::Confirmed]),
            from: Some(now),
            to: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }
}

/// Partial mutation applied through the store's compare-and-swap update.
/// `updated_at` is bumped by the store itself, never by callers.
#[derive(Debug, Clone, Default)]
pub struct AppointmentPatch {
    pub status: Option<AppointmentStatus>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub join_link: Option<String>,
    pub room_id: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    pub cancellation_reason: Option<String>,
    pub decline_reason: Option<String>,
}

// ==============================================================================
// STORE CONTRACT
// ==============================================================================

/// Durable CRUD over appointment records. Validates record shape only;
/// transition rules and authorization live in the lifecycle service.
/// Records are never deleted, terminal appointments stay as history.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, request: &BookAppointmentRequest) -> Result<Appointment, AppointmentError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Appointment, AppointmentError>;

    async fn list_for_party(
        &self,
        party_id: Uuid,
        role: PartyRole,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, AppointmentError>;

    /// Compare-and-swap update: the write only applies if the stored
    /// `updated_at` still equals `expected_updated_at`. A concurrent
    /// mutation since the caller's read fails with `Conflict` and the
    /// record is left untouched.
    async fn update(
        &self,
        id: Uuid,
        expected_updated_at: DateTime<Utc>,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, AppointmentError>;
}

fn validate_new_appointment(
    request: &BookAppointmentRequest,
    now: DateTime<Utc>,
) -> Result<(), AppointmentError> {
    if request.duration_minutes <= 0 {
        return Err(AppointmentError::ValidationError(
            "Appointment duration must be a positive number of minutes".to_string(),
        ));
    }
    if request.scheduled_at <= now {
        return Err(AppointmentError::ValidationError(
            "Appointment must be scheduled for a future time".to_string(),
        ));
    }
    Ok(())
}

/// Postgres stores timestamptz at microsecond precision; second precision
/// keeps the optimistic-lock token round-trippable through PostgREST filters.
fn storage_timestamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_nanosecond(0).unwrap_or(now)
}

fn patch_to_json(patch: &AppointmentPatch, new_updated_at: DateTime<Utc>) -> Value {
    let mut body = json!({
        "updated_at": new_updated_at,
    });
    let map = body.as_object_mut().unwrap();

    if let Some(status) = patch.status {
        map.insert("status".to_string(), json!(status));
    }
    if let Some(scheduled_at) = patch.scheduled_at {
        map.insert("scheduled_at".to_string(), json!(scheduled_at));
    }
    if let Some(join_link) = &patch.join_link {
        map.insert("join_link".to_string(), json!(join_link));
    }
    if let Some(room_id) = &patch.room_id {
        map.insert("room_id".to_string(), json!(room_id));
    }
    if let Some(cancelled_by) = patch.cancelled_by {
        map.insert("cancelled_by".to_string(), json!(cancelled_by));
    }
    if let Some(reason) = &patch.cancellation_reason {
        map.insert("cancellation_reason".to_string(), json!(reason));
    }
    if let Some(reason) = &patch.decline_reason {
        map.insert("decline_reason".to_string(), json!(reason));
    }

    body
}

// ==============================================================================
// SUPABASE-BACKED STORE
// ==============================================================================

pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseAppointmentStore {
    pub fn new(config: &AppConfig, auth_token: &str) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            auth_token: auth_token.to_string(),
        }
    }
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn create(&self, request: &BookAppointmentRequest) -> Result<Appointment, AppointmentError> {
        let now = storage_timestamp(Utc::now());
        validate_new_appointment(request, now)?;

        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            nutritionist_id: request.nutritionist_id,
            scheduled_at: request.scheduled_at,
            duration_minutes: request.duration_minutes,
            consultation_type_code: request.consultation_type_code.clone(),
            mode: request.mode,
            status: AppointmentStatus::Pending,
            join_link: None,
            room_id: None,
            patient_message: request.patient_message.clone(),
            cancelled_by: CancelledBy::None,
            cancellation_reason: None,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        };

        debug!("Creating appointment {}", appointment.id);

        let result: Vec<Appointment> = self
            .supabase
            .write(
                Method::POST,
                "/rest/v1/appointments",
                Some(&self.auth_token),
                Some(serde_json::to_value(&appointment).map_err(|e| {
                    AppointmentError::DatabaseError(format!("Failed to serialize appointment: {}", e))
                })?),
            )
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        result
            .into_iter()
            .next()
            .ok_or_else(|| AppointmentError::DatabaseError("Insert returned no rows".to_string()))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Appointment, AppointmentError> {
        debug!("Fetching appointment: {}", id);

        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let result: Vec<Appointment> = self
            .supabase
            .request(Method::GET, &path, Some(&self.auth_token), None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        result.into_iter().next().ok_or(AppointmentError::NotFound)
    }

    async fn list_for_party(
        &self,
        party_id: Uuid,
        role: PartyRole,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let party_column = match role {
            PartyRole::Patient => "patient_id",
            PartyRole::Nutritionist => "nutritionist_id",
        };

        let mut query_parts = vec![format!("{}=eq.{}", party_column, party_id)];

        if let Some(statuses) = &filter.statuses {
            let list = statuses
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            query_parts.push(format!("status=in.({})", list));
        }
        if let Some(from) = filter.from {
            let encoded = urlencoding::encode(&from.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_at=gte.{}", encoded));
        }
        if let Some(to) = filter.to {
            let encoded = urlencoding::encode(&to.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_at=lte.{}", encoded));
        }

        let order = match filter.order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };

        let mut path = format!(
            "/rest/v1/appointments?{}&order=scheduled_at.{}",
            query_parts.join("&"),
            order
        );
        if let Some(limit) = filter.limit {
            path.push_str(&format!("&limit={}", limit));
        }

        let result: Vec<Appointment> = self
            .supabase
            .request(Method::GET, &path, Some(&self.auth_token), None)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        Ok(result)
    }

    async fn update(
        &self,
        id: Uuid,
        expected_updated_at: DateTime<Utc>,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, AppointmentError> {
        let mut new_updated_at = storage_timestamp(Utc::now());
        if new_updated_at <= expected_updated_at {
            // updated_at is monotonically non-decreasing and doubles as the
            // optimistic-lock token, so consecutive writes within the same
            // second must still produce distinct values.
            new_updated_at = expected_updated_at + chrono::Duration::seconds(1);
        }

        // Conditional PATCH: the updated_at filter makes this a
        // compare-and-swap, the row is only written if untouched since read.
        let encoded_token = urlencoding::encode(&expected_updated_at.to_rfc3339()).into_owned();
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&updated_at=eq.{}",
            id, encoded_token
        );

        let result: Vec<Appointment> = self
            .supabase
            .write(
                Method::PATCH,
                &path,
                Some(&self.auth_token),
                Some(patch_to_json(patch, new_updated_at)),
            )
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        if let Some(updated) = result.into_iter().next() {
            return Ok(updated);
        }

        // Nothing matched: either the id is unknown or the token is stale.
        match self.get_by_id(id).await {
            Ok(_) => Err(AppointmentError::Conflict),
            Err(AppointmentError::NotFound) => Err(AppointmentError::NotFound),
            Err(e) => Err(e),
        }
    }
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

/// RwLock-backed store with the same CAS discipline as the Supabase
/// implementation. Used by the lifecycle tests and local runs.
#[derive(Default)]
pub struct MemoryAppointmentStore {
    records: RwLock<HashMap<Uuid, Appointment>>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing creation validation. Test helper
    /// for appointments that are already underway or in the past.
    pub fn insert_raw(&self, appointment: Appointment) {
        self.records
            .write()
            .unwrap()
            .insert(appointment.id, appointment);
    }
}

#[async_trait]
impl AppointmentStore for MemoryAppointmentStore {
    async fn create(&self, request: &BookAppointmentRequest) -> Result<Appointment, AppointmentError> {
        let now = Utc::now();
        validate_new_appointment(request, now)?;

        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            nutritionist_id: request.nutritionist_id,
            scheduled_at: request.scheduled_at,
            duration_minutes: request.duration_minutes,
            consultation_type_code: request.consultation_type_code.clone(),
            mode: request.mode,
            status: AppointmentStatus::Pending,
            join_link: None,
            room_id: None,
            patient_message: request.patient_message.clone(),
            cancelled_by: CancelledBy::None,
            cancellation_reason: None,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.records
            .write()
            .unwrap()
            .insert(appointment.id, appointment.clone());

        Ok(appointment)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Appointment, AppointmentError> {
        self.records
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(AppointmentError::NotFound)
    }

    async fn list_for_party(
        &self,
        party_id: Uuid,
        role: PartyRole,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let records = self.records.read().unwrap();

        let mut matches: Vec<Appointment> = records
            .values()
            .filter(|apt| match role {
                PartyRole::Patient => apt.patient_id == party_id,
                PartyRole::Nutritionist => apt.nutritionist_id == party_id,
            })
            .filter(|apt| {
                filter
                    .statuses
                    .as_ref()
                    .map(|s| s.contains(&apt.status))
                    .unwrap_or(true)
            })
            .filter(|apt| filter.from.map(|from| apt.scheduled_at >= from).unwrap_or(true))
            .filter(|apt| filter.to.map(|to| apt.scheduled_at <= to).unwrap_or(true))
            .cloned()
            .collect();

        match filter.order {
            SortOrder::Ascending => matches.sort_by_key(|apt| apt.scheduled_at),
            SortOrder::Descending => {
                matches.sort_by_key(|apt| std::cmp::Reverse(apt.scheduled_at))
            }
        }

        if let Some(limit) = filter.limit {
            matches.truncate(limit.max(0) as usize);
        }

        Ok(matches)
    }

    async fn update(
        &self,
        id: Uuid,
        expected_updated_at: DateTime<Utc>,
        patch: &AppointmentPatch,
    ) -> Result<Appointment, AppointmentError> {
        let mut records = self.records.write().unwrap();

        let appointment = records.get_mut(&id).ok_or(AppointmentError::NotFound)?;

        if appointment.updated_at != expected_updated_at {
            return Err(AppointmentError::Conflict);
        }

        if let Some(status) = patch.status {
            appointment.status = status;
        }
        if let Some(scheduled_at) = patch.scheduled_at {
            appointment.scheduled_at = scheduled_at;
        }
        if let Some(join_link) = &patch.join_link {
            appointment.join_link = Some(join_link.clone());
        }
        if let Some(room_id) = &patch.room_id {
            appointment.room_id = Some(room_id.clone());
        }
        if let Some(cancelled_by) = patch.cancelled_by {
            appointment.cancelled_by = cancelled_by;
        }
        if let Some(reason) = &patch.cancellation_reason {
            appointment.cancellation_reason = Some(reason.clone());
        }
        if let Some(reason) = &patch.decline_reason {
            appointment.decline_reason = Some(reason.clone());
        }

        let mut now = Utc::now();
        if now <= appointment.updated_at {
            now = appointment.updated_at + chrono::Duration::microseconds(1);
        }
        appointment.updated_at = now;

        Ok(appointment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentMode;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn remote_booking() -> BookAppointmentRequest {
        BookAppointmentRequest {
            patient_id: Uuid::new_v4(),
            nutritionist_id: Uuid::new_v4(),
            scheduled_at: Utc::now() + Duration::days(2),
            duration_minutes: 45,
            mode: AppointmentMode::Remote,
            consultation_type_code: "initial_consultation".to_string(),
            patient_message: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_non_positive_duration() {
        let store = MemoryAppointmentStore::new();
        let mut request = remote_booking();
        request.duration_minutes = 0;

        let result = store.create(&request).await;
        assert_matches!(result, Err(AppointmentError::ValidationError(_)));
    }

    #[tokio::test]
    async fn create_rejects_past_schedule() {
        let store = MemoryAppointmentStore::new();
        let mut request = remote_booking();
        request.scheduled_at = Utc::now() - Duration::hours(1);

        let result = store.create(&request).await;
        assert_matches!(result, Err(AppointmentError::ValidationError(_)));
    }

    #[tokio::test]
    async fn update_with_stale_token_conflicts() {
        let store = MemoryAppointmentStore::new();
        let created = store.create(&remote_booking()).await.unwrap();

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Confirmed),
            ..Default::default()
        };
        let first = store.update(created.id, created.updated_at, &patch).await.unwrap();
        assert!(first.updated_at > created.updated_at);

        // Second writer still holds the original token
        let result = store.update(created.id, created.updated_at, &patch).await;
        assert_matches!(result, Err(AppointmentError::Conflict));
    }

    #[tokio::test]
    async fn list_orders_by_schedule() {
        let store = MemoryAppointmentStore::new();
        let patient_id = Uuid::new_v4();

        let mut early = remote_booking();
        early.patient_id = patient_id;
        early.scheduled_at = Utc::now() + Duration::days(1);
        let mut late = remote_booking();
        late.patient_id = patient_id;
        late.scheduled_at = Utc::now() + Duration::days(3);

        store.create(&late).await.unwrap();
        store.create(&early).await.unwrap();

        let upcoming = store
            .list_for_party(patient_id, PartyRole::Patient, &AppointmentFilter::upcoming(Utc::now()))
            .await
            .unwrap();
        assert_eq!(upcoming.len(), 2);
        assert!(upcoming[0].scheduled_at < upcoming[1].scheduled_at);

        let history = store
            .list_for_party(patient_id, PartyRole::Patient, &AppointmentFilter::default())
            .await
            .unwrap();
        assert!(history[0].scheduled_at > history[1].scheduled_at);
    }
}
