use async_trait::async_trait;
use tracing::info;

use crate::error::PushError;
use crate::message::{DeliveryReport, PushMessage};

/// Interface to an external push-notification service.
///
/// `send_bulk` must return exactly one report per token, in token order.
/// An `Err` means the request as a whole failed and nobody was reached.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<DeliveryReport, PushError>;

    async fn send_bulk(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<DeliveryReport>, PushError>;
}

/// Provider used when no push service is configured: logs the message and
/// reports it as delivered.
pub struct LogProvider;

#[async_trait]
impl PushProvider for LogProvider {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<DeliveryReport, PushError> {
        info!("[push] to {}: {} / {} {:?}", token, message.title, message.body, message.data);
        Ok(DeliveryReport::Delivered)
    }

    async fn send_bulk(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<DeliveryReport>, PushError> {
        info!(
            "[push] to {} devices: {} / {} {:?}",
            tokens.len(),
            message.title,
            message.body,
            message.data
        );
        Ok(vec![DeliveryReport::Delivered; tokens.len()])
    }
}
