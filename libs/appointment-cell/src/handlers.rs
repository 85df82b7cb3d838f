// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use chrono::{DateTime, Utc};
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use notification_cell::SupabaseNotificationEmitter;
use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    Actor, AppointmentError, AppointmentStatus, BookAppointmentRequest, CancelAppointmentRequest,
    DeclineAppointmentRequest, RescheduleAppointmentRequest,
};
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::services::store::{AppointmentFilter, SortOrder, SupabaseAppointmentStore};
use crate::services::visio::VisioSessionResolver;

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct AppointmentQueryParams {
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub order: Option<String>,
    pub limit: Option<i32>,
}

// ==============================================================================
// WIRING HELPERS
// ==============================================================================

fn lifecycle_service(config: &AppConfig, token: &str) -> AppointmentLifecycleService {
    let store = Arc::new(SupabaseAppointmentStore::new(config, token));
    let emitter = Arc::new(SupabaseNotificationEmitter::with_token(config, token));
    AppointmentLifecycleService::new(store, emitter, VisioSessionResolver::new(config))
}

fn actor_from_user(user: &User) -> Result<Actor, AppError> {
    let id = Uuid::parse_str(&user.id)
        .map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))?;

    Ok(if user.is_nutritionist() {
        Actor::nutritionist(id)
    } else if user.is_admin() {
        // Admins get the system actor's read scope
        Actor { id, role: crate::models::ActorRole::System }
    } else {
        Actor::patient(id)
    })
}

/// Authorization failures map onto the same 404 as a missing record so
/// non-parties cannot probe which appointment ids exist.
fn map_error(e: AppointmentError) -> AppError {
    match e {
        AppointmentError::NotFound | AppointmentError::Unauthorized => {
            AppError::NotFound("Appointment not found".to_string())
        }
        AppointmentError::InvalidTransition(status) => {
            AppError::BadRequest(format!("Cannot modify appointment in status: {}", status))
        }
        AppointmentError::ValidationError(msg) => AppError::BadRequest(msg),
        AppointmentError::Conflict => AppError::Conflict(
            "Appointment was modified concurrently, please retry".to_string(),
        ),
        AppointmentError::InvalidMode(mode) => {
            AppError::BadRequest(format!("No visio session for {} appointments", mode))
        }
        AppointmentError::DatabaseError(msg) => AppError::Internal(msg),
    }
}

// ==============================================================================
// BOOKING AND LIFECYCLE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn book_appointment(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<BookAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service.book(request, actor).await.map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment requested, awaiting confirmation"
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service.get(appointment_id, actor).await.map_err(map_error)?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(state): State<Arc<AppConfig>>,
    Query(params): Query<AppointmentQueryParams>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let filter = AppointmentFilter {
        statuses: params.status.map(|s| vec![s]),
        from: params.from_date,
        to: params.to_date,
        order: match params.order.as_deref() {
            Some("asc") => SortOrder::Ascending,
            _ => SortOrder::Descending,
        },
        limit: params.limit,
    };

    let appointments = service
        .list_for_actor(actor, &filter)
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

#[axum::debug_handler]
pub async fn get_next_appointment(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service.next_appointment(actor).await.map_err(map_error)?;

    Ok(Json(json!({ "appointment": appointment })))
}

#[axum::debug_handler]
pub async fn confirm_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service
        .confirm(appointment_id, actor)
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment confirmed"
    })))
}

#[axum::debug_handler]
pub async fn decline_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<DeclineAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service
        .decline(appointment_id, actor, &request.reason)
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment declined"
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<RescheduleAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service
        .reschedule(appointment_id, actor, request.new_scheduled_at)
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment rescheduled"
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service
        .cancel(appointment_id, actor, request.reason.as_deref())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled"
    })))
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let appointment = service
        .complete(appointment_id, actor, Utc::now())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment completed"
    })))
}

// ==============================================================================
// VISIO JOIN HANDLER
// ==============================================================================

#[axum::debug_handler]
pub async fn resolve_join(
    State(state): State<Arc<AppConfig>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&user)?;
    let service = lifecycle_service(&state, auth.token());

    let resolution = service
        .resolve_join(appointment_id, actor, Utc::now())
        .await
        .map_err(map_error)?;

    Ok(Json(json!(resolution)))
}
