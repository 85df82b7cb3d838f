// libs/notification-cell/src/emitter.rs
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{NotificationCode, NotificationError};

/// Best-effort notification sink. Callers must treat delivery as
/// fire-and-forget: a failed emit is logged by the caller and never
/// rolls back the state transition that triggered it.
#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    async fn notify(
        &self,
        recipient_id: Uuid,
        code: NotificationCode,
        data: Value,
    ) -> Result<(), NotificationError>;
}

/// Emitter that inserts a row into the Supabase `notifications` table,
/// which the frontend polls / subscribes to.
pub struct SupabaseNotificationEmitter {
    supabase: Arc<SupabaseClient>,
    auth_token: Option<String>,
}

impl SupabaseNotificationEmitter {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            auth_token: None,
        }
    }

    pub fn with_token(config: &AppConfig, auth_token: &str) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            auth_token: Some(auth_token.to_string()),
        }
    }
}

#[async_trait]
impl NotificationEmitter for SupabaseNotificationEmitter {
    async fn notify(
        &self,
        recipient_id: Uuid,
        code: NotificationCode,
        data: Value,
    ) -> Result<(), NotificationError> {
        debug!("Emitting {} notification to {}", code, recipient_id);

        let body = json!({
            "recipient_id": recipient_id,
            "template_code": code,
            "template_data": data,
            "read": false,
        });

        let _: Vec<Value> = self
            .supabase
            .write(
                Method::POST,
                "/rest/v1/notifications",
                self.auth_token.as_deref(),
                Some(body),
            )
            .await
            .map_err(|e| NotificationError::DatabaseError(e.to_string()))?;

        info!("Notification {} emitted to {}", code, recipient_id);
        Ok(())
    }
}

/// Log-only emitter used in tests and local development.
#[derive(Default)]
pub struct TracingNotificationEmitter;

#[async_trait]
impl NotificationEmitter for TracingNotificationEmitter {
    async fn notify(
        &self,
        recipient_id: Uuid,
        code: NotificationCode,
        data: Value,
    ) -> Result<(), NotificationError> {
        info!("notification: {} -> {} ({})", code, recipient_id, data);
        Ok(())
    }
}
