pub mod emitter;
pub mod models;

pub use emitter::{NotificationEmitter, SupabaseNotificationEmitter, TracingNotificationEmitter};
pub use models::{NotificationCode, NotificationError};
