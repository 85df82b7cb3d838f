use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use uuid::Uuid;

use appointment_cell::models::{
    Actor, Appointment, AppointmentError, AppointmentMode, AppointmentStatus,
    BookAppointmentRequest, CancelledBy,
};
use appointment_cell::services::lifecycle::AppointmentLifecycleService;
use appointment_cell::services::store::{AppointmentStore, MemoryAppointmentStore};
use appointment_cell::services::visio::VisioSessionResolver;
use notification_cell::TracingNotificationEmitter;
use shared_utils::test_utils::TestConfig;

fn build_service() -> (Arc<MemoryAppointmentStore>, AppointmentLifecycleService) {
    let store = Arc::new(MemoryAppointmentStore::new());
    let emitter = Arc::new(TracingNotificationEmitter);
    let config = TestConfig::default().to_app_config();
    let service = AppointmentLifecycleService::new(
        store.clone(),
        emitter,
        VisioSessionResolver::new(&config),
    );
    (store, service)
}

fn booking(patient_id: Uuid, nutritionist_id: Uuid, mode: AppointmentMode) -> BookAppointmentRequest {
    BookAppointmentRequest {
        patient_id,
        nutritionist_id,
        scheduled_at: Utc::now() + Duration::days(2),
        duration_minutes: 45,
        mode,
        consultation_type_code: "initial_consultation".to_string(),
        patient_message: Some("First consultation request".to_string()),
    }
}

async fn booked_appointment(
    service: &AppointmentLifecycleService,
    mode: AppointmentMode,
) -> (Appointment, Actor, Actor) {
    let patient = Actor::patient(Uuid::new_v4());
    let nutritionist = Actor::nutritionist(Uuid::new_v4());
    let appointment = service
        .book(booking(patient.id, nutritionist.id, mode), patient)
        .await
        .unwrap();
    (appointment, patient, nutritionist)
}

// ==============================================================================
// BOOKING
// ==============================================================================

#[tokio::test]
async fn booking_creates_pending_with_derived_end() {
    let (_, service) = build_service();
    let (appointment, _, _) = booked_appointment(&service, AppointmentMode::Remote).await;

    assert_eq!(appointment.status, AppointmentStatus::Pending);
    assert_eq!(
        appointment.scheduled_end_at(),
        appointment.scheduled_at + Duration::minutes(45)
    );
    assert_eq!(appointment.cancelled_by, CancelledBy::None);
    assert!(appointment.join_link.is_none());
    assert!(appointment.room_id.is_none());
}

#[tokio::test]
async fn booking_for_another_patient_is_rejected() {
    let (_, service) = build_service();
    let request = booking(Uuid::new_v4(), Uuid::new_v4(), AppointmentMode::Remote);

    let result = service.book(request, Actor::patient(Uuid::new_v4())).await;
    assert_matches!(result, Err(AppointmentError::Unauthorized));
}

// ==============================================================================
// CONFIRM / DECLINE / RESCHEDULE
// ==============================================================================

#[tokio::test]
async fn nutritionist_confirms_pending_appointment() {
    let (store, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    let confirmed = service.confirm(appointment.id, nutritionist).await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
    assert!(confirmed.updated_at > appointment.updated_at);

    let stored = store.get_by_id(appointment.id).await.unwrap();
    assert_eq!(stored.status, AppointmentStatus::Confirmed);
}

#[tokio::test]
async fn patient_cannot_confirm() {
    let (store, service) = build_service();
    let (appointment, patient, _) = booked_appointment(&service, AppointmentMode::Remote).await;

    let result = service.confirm(appointment.id, patient).await;
    assert_matches!(result, Err(AppointmentError::Unauthorized));

    let stored = store.get_by_id(appointment.id).await.unwrap();
    assert_eq!(stored, appointment);
}

#[tokio::test]
async fn decline_requires_a_meaningful_reason() {
    let (store, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    for reason in ["", "  ", "1234", "    ab    "] {
        let result = service.decline(appointment.id, nutritionist, reason).await;
        assert_matches!(result, Err(AppointmentError::ValidationError(_)));
    }

    let stored = store.get_by_id(appointment.id).await.unwrap();
    assert_eq!(stored, appointment);
}

#[tokio::test]
async fn decline_records_reason() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    let declined = service
        .decline(appointment.id, nutritionist, "No availability that week")
        .await
        .unwrap();

    assert_eq!(declined.status, AppointmentStatus::Declined);
    assert_eq!(
        declined.decline_reason.as_deref(),
        Some("No availability that week")
    );
}

#[tokio::test]
async fn reschedule_moves_slot_and_keeps_pending() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    let new_slot = appointment.scheduled_at + Duration::days(1);
    let rescheduled = service
        .reschedule(appointment.id, nutritionist, new_slot)
        .await
        .unwrap();

    assert_eq!(rescheduled.status, AppointmentStatus::Pending);
    assert_eq!(rescheduled.scheduled_at, new_slot);
    assert_eq!(
        rescheduled.scheduled_end_at(),
        new_slot + Duration::minutes(45)
    );
}

#[tokio::test]
async fn reschedule_rejects_past_slot() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    let result = service
        .reschedule(appointment.id, nutritionist, Utc::now() - Duration::hours(1))
        .await;
    assert_matches!(result, Err(AppointmentError::ValidationError(_)));
}

// ==============================================================================
// CANCELLATION
// ==============================================================================

#[tokio::test]
async fn patient_cancels_without_reason() {
    let (_, service) = build_service();
    let (appointment, patient, _) = booked_appointment(&service, AppointmentMode::Remote).await;

    let cancelled = service.cancel(appointment.id, patient, None).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, CancelledBy::Patient);
    assert!(cancelled.cancellation_reason.is_none());
}

#[tokio::test]
async fn nutritionist_cancel_requires_reason() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    let result = service.cancel(appointment.id, nutritionist, None).await;
    assert_matches!(result, Err(AppointmentError::ValidationError(_)));

    let cancelled = service
        .cancel(appointment.id, nutritionist, Some("Personal emergency"))
        .await
        .unwrap();
    assert_eq!(cancelled.cancelled_by, CancelledBy::Nutritionist);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Personal emergency"));
}

#[tokio::test]
async fn confirmed_appointment_can_still_be_cancelled() {
    let (_, service) = build_service();
    let (appointment, patient, nutritionist) =
        booked_appointment(&service, AppointmentMode::Remote).await;

    service.confirm(appointment.id, nutritionist).await.unwrap();
    let cancelled = service
        .cancel(appointment.id, patient, Some("Schedule clash"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

// ==============================================================================
// TERMINAL STATES
// ==============================================================================

#[tokio::test]
async fn terminal_states_reject_all_transitions_unchanged() {
    let (store, service) = build_service();
    let (appointment, patient, nutritionist) =
        booked_appointment(&service, AppointmentMode::Remote).await;

    service.cancel(appointment.id, patient, None).await.unwrap();
    let snapshot = store.get_by_id(appointment.id).await.unwrap();

    assert_matches!(
        service.confirm(appointment.id, nutritionist).await,
        Err(AppointmentError::InvalidTransition(AppointmentStatus::Cancelled))
    );
    assert_matches!(
        service.decline(appointment.id, nutritionist, "Too late now").await,
        Err(AppointmentError::InvalidTransition(AppointmentStatus::Cancelled))
    );
    assert_matches!(
        service
            .reschedule(appointment.id, nutritionist, Utc::now() + Duration::days(3))
            .await,
        Err(AppointmentError::InvalidTransition(AppointmentStatus::Cancelled))
    );
    assert_matches!(
        service.cancel(appointment.id, patient, None).await,
        Err(AppointmentError::InvalidTransition(AppointmentStatus::Cancelled))
    );
    assert_matches!(
        service.complete(appointment.id, nutritionist, Utc::now()).await,
        Err(AppointmentError::InvalidTransition(AppointmentStatus::Cancelled))
    );

    // The failed attempts must leave the record exactly as it was
    let after = store.get_by_id(appointment.id).await.unwrap();
    assert_eq!(after, snapshot);
}

// ==============================================================================
// COMPLETION
// ==============================================================================

#[tokio::test]
async fn complete_rejected_while_slot_is_running() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    service.confirm(appointment.id, nutritionist).await.unwrap();

    let result = service
        .complete(appointment.id, nutritionist, appointment.scheduled_end_at())
        .await;
    assert_matches!(result, Err(AppointmentError::ValidationError(_)));
}

#[tokio::test]
async fn complete_after_slot_end() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    service.confirm(appointment.id, nutritionist).await.unwrap();

    let completed = service
        .complete(
            appointment.id,
            nutritionist,
            appointment.scheduled_end_at() + Duration::minutes(1),
        )
        .await
        .unwrap();
    assert_eq!(completed.status, AppointmentStatus::Completed);
}

#[tokio::test]
async fn system_actor_reads_any_appointment() {
    let (_, service) = build_service();
    let (appointment, _, _) = booked_appointment(&service, AppointmentMode::Remote).await;

    let fetched = service.get(appointment.id, Actor::system()).await.unwrap();
    assert_eq!(fetched.id, appointment.id);
}

#[tokio::test]
async fn system_actor_cannot_drive_party_transitions() {
    let (store, service) = build_service();
    let (appointment, _, _) = booked_appointment(&service, AppointmentMode::Remote).await;

    assert_matches!(
        service.confirm(appointment.id, Actor::system()).await,
        Err(AppointmentError::Unauthorized)
    );
    assert_matches!(
        service
            .decline(appointment.id, Actor::system(), "Admin override")
            .await,
        Err(AppointmentError::Unauthorized)
    );
    assert_matches!(
        service
            .reschedule(appointment.id, Actor::system(), Utc::now() + Duration::days(3))
            .await,
        Err(AppointmentError::Unauthorized)
    );
    assert_matches!(
        service.cancel(appointment.id, Actor::system(), None).await,
        Err(AppointmentError::Unauthorized)
    );
    assert_matches!(
        service.next_appointment(Actor::system()).await,
        Err(AppointmentError::Unauthorized)
    );

    let stored = store.get_by_id(appointment.id).await.unwrap();
    assert_eq!(stored, appointment);
}

#[tokio::test]
async fn system_actor_can_complete() {
    let (_, service) = build_service();
    let (appointment, _, nutritionist) = booked_appointment(&service, AppointmentMode::Remote).await;

    service.confirm(appointment.id, nutritionist).await.unwrap();

    let completed = service
        .complete(
            appointment.id,
            Actor::system(),
            appointment.scheduled_end_at() + Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(completed.status, AppointmentStatus::Completed);
}

// ==============================================================================
// CONCURRENCY
// ==============================================================================

#[tokio::test]
async fn concurrent_confirm_and_decline_applies_exactly_one() {
    let (store, service) = build_service();
    let (appointment, _, nutritionist) =
        booked_appointment(&service, AppointmentMode::Remote).await;

    // Both transitions are only valid from pending, so whichever write
    // lands second must fail: on the CAS if it raced the read, on the
    // status guard if it read after the winner's write.
    let (confirm_result, decline_result) = tokio::join!(
        service.confirm(appointment.id, nutritionist),
        service.decline(appointment.id, nutritionist, "Slot no longer available"),
    );

    let succeeded = [confirm_result.is_ok(), decline_result.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(succeeded, 1, "exactly one of the racing writes must win");

    let final_status = store.get_by_id(appointment.id).await.unwrap().status;
    match (&confirm_result, &decline_result) {
        (Ok(_), Err(loser)) => {
            assert_eq!(final_status, AppointmentStatus::Confirmed);
            assert_matches!(
                loser,
                AppointmentError::Conflict | AppointmentError::InvalidTransition(_)
            );
        }
        (Err(loser), Ok(_)) => {
            assert_eq!(final_status, AppointmentStatus::Declined);
            assert_matches!(
                loser,
                AppointmentError::Conflict | AppointmentError::InvalidTransition(_)
            );
        }
        _ => unreachable!("exactly one result is Ok"),
    }
}

// ==============================================================================
// NEXT APPOINTMENT
// ==============================================================================

#[tokio::test]
async fn next_appointment_is_earliest_active_future_slot() {
    let (_, service) = build_service();
    let patient = Actor::patient(Uuid::new_v4());
    let nutritionist = Actor::nutritionist(Uuid::new_v4());

    let mut near = booking(patient.id, nutritionist.id, AppointmentMode::Remote);
    near.scheduled_at = Utc::now() + Duration::days(1);
    let mut far = booking(patient.id, nutritionist.id, AppointmentMode::Remote);
    far.scheduled_at = Utc::now() + Duration::days(5);

    let near_appointment = service.book(near, patient).await.unwrap();
    service.book(far, patient).await.unwrap();

    let next = service.next_appointment(patient).await.unwrap().unwrap();
    assert_eq!(next.id, near_appointment.id);

    // A cancelled near appointment no longer counts
    service.cancel(near_appointment.id, patient, None).await.unwrap();
    let next = service.next_appointment(patient).await.unwrap().unwrap();
    assert_ne!(next.id, near_appointment.id);
}

#[tokio::test]
async fn next_appointment_empty_for_unknown_party() {
    let (_, service) = build_service();
    let next = service
        .next_appointment(Actor::patient(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(next.is_none());
}
