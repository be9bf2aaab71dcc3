use async_trait::async_trait;
use rabbitmq::{Delivery, Subscription};

use super::relay::{MessageSource, RelayError};

/// Deliveries from a RabbitMQ queue.
///
/// A successful settle acks the delivery; a failed one nacks it without
/// requeueing, so the broker drops it or dead-letters it.
#[async_trait]
impl MessageSource for Subscription {
    type Message = Delivery;

    async fn receive(&mut self) -> Option<Delivery> {
        Subscription::receive(self).await
    }

    fn payload<'m>(&self, message: &'m Delivery) -> &'m [u8] {
        message.content.as_deref().unwrap_or_default()
    }

    async fn acknowledge(&mut self, message: &Delivery, success: bool) -> Result<(), RelayError> {
        let settled = if success {
            self.ack(message).await
        } else {
            self.nack(message, false).await
        };
        settled.map_err(|err| RelayError::Acknowledge(err.to_string()))
    }
}
