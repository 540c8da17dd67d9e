//! Push notification delivery for Gather.
//!
//! - `PushProvider`: the seam to the external push service (FCM in production)
//! - `Notifier`: single and bulk dispatch, deferral of undeliverable messages,
//!   replay on device registration
//! - `policy`: which users hear about which domain event

pub mod error;
pub mod fcm;
pub mod message;
pub mod notifier;
pub mod policy;
pub mod provider;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::PushError;
pub use fcm::FcmClient;
pub use message::{DeliveryReport, MessageTag, Notification, PushMessage};
pub use notifier::{BulkDelivery, Notifier, Registration, Replay};
pub use provider::{LogProvider, PushProvider};
