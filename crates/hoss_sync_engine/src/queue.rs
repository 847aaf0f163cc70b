//! Notification queue capability and body decoding.
//!
//! Transports (AMQP, SQS) live outside the engine. They implement [`Queue`]
//! and use [`decode`] to turn raw bodies into [`Message`]s.

use crate::core_api::NotificationQueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::message::{ApiEvent, BucketNotification, Message};
use async_trait::async_trait;
use std::fmt;

/// A receive-only stream of decoded messages.
///
/// Depending on the transport, delivery is at-most-once or at-least-once;
/// consumers must tolerate both duplicates and losses.
#[async_trait]
pub trait Queue: Send {
    /// Waits for the next message. `None` means the queue is closed.
    async fn recv(&mut self) -> Option<Message>;
}

/// Opens the queues a core service asks the engine to consume.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    /// Opens one queue.
    async fn open(
        &self,
        core_service: &str,
        config: &NotificationQueueConfig,
    ) -> SyncResult<Box<dyn Queue>>;
}

/// Body format carried by a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Storage provider notifications, a `Records` array.
    BucketNotification,
    /// One core service lifecycle event.
    ApiNotification,
}

impl MessageFormat {
    /// Returns the `message_type` setting value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::BucketNotification => "bucket_notification",
            MessageFormat::ApiNotification => "api_notification",
        }
    }

    /// Reads the format from a queue configuration.
    pub fn from_config(config: &NotificationQueueConfig) -> SyncResult<Self> {
        match config.message_type() {
            Some("bucket_notification") => Ok(MessageFormat::BucketNotification),
            Some("api_notification") => Ok(MessageFormat::ApiNotification),
            other => Err(SyncError::Config(format!(
                "unsupported message type {:?}",
                other.unwrap_or_default()
            ))),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes one queue body.
///
/// Bucket notifications yield one message per record, each stamped with the
/// queue's storage endpoint.
pub fn decode(format: MessageFormat, body: &[u8], source_endpoint: &str) -> SyncResult<Vec<Message>> {
    match format {
        MessageFormat::BucketNotification => {
            let notification: BucketNotification = serde_json::from_slice(body)?;
            Ok(notification
                .records
                .into_iter()
                .map(|record| Message::Bucket(record.with_endpoint(source_endpoint)))
                .collect())
        }
        MessageFormat::ApiNotification => {
            let event: ApiEvent = serde_json::from_slice(body)?;
            Ok(vec![Message::Api(event)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ApiEventType;

    #[test]
    fn decode_bucket_records() {
        let body = br#"{"Records": [
            {"eventName": "s3:ObjectCreated:Put", "s3": {"bucket": {"name": "b"}, "object": {"key": "ds/a", "size": 1}}},
            {"eventName": "s3:ObjectRemoved:Delete", "s3": {"bucket": {"name": "b"}, "object": {"key": "ds/b"}}}
        ]}"#;
        let messages = decode(MessageFormat::BucketNotification, body, "http://minio:9000").unwrap();
        assert_eq!(messages.len(), 2);
        for message in messages {
            let Message::Bucket(event) = message else {
                panic!("expected bucket event");
            };
            assert_eq!(event.endpoint, "http://minio:9000");
        }
    }

    #[test]
    fn decode_api_event() {
        let body = br#"{"event_type": "create-namespace", "source_endpoint": "http://core/v1", "object_store": "default"}"#;
        let messages = decode(MessageFormat::ApiNotification, body, "").unwrap();
        let [Message::Api(event)] = messages.as_slice() else {
            panic!("expected one API event");
        };
        assert_eq!(event.event_type, ApiEventType::CreateNamespace);
    }

    #[test]
    fn malformed_body_is_decode_error() {
        let err = decode(MessageFormat::ApiNotification, b"{", "").unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn format_from_settings() {
        let config: NotificationQueueConfig = serde_json::from_str(
            r#"{"type": "sqs", "settings": {"message_type": "api_notification"}}"#,
        )
        .unwrap();
        assert_eq!(MessageFormat::from_config(&config).unwrap(), MessageFormat::ApiNotification);

        let config: NotificationQueueConfig =
            serde_json::from_str(r#"{"type": "sqs", "settings": {}}"#).unwrap();
        assert!(MessageFormat::from_config(&config).is_err());
    }
}
