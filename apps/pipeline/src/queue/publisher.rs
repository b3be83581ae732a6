//! Redis Streams publisher. A queue is a stream; XADD returning an entry id
//! is the broker's acceptance confirmation.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::debug;

use crate::errors::PublishError;
use crate::queue::QueuePublisher;

pub struct StreamPublisher {
    conn: MultiplexedConnection,
    queue: String,
}

impl StreamPublisher {
    pub async fn connect(client: &redis::Client, queue: String) -> Result<Self, PublishError> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PublishError::Broker {
                queue: queue.clone(),
                reason: e.to_string(),
            })?;
        Ok(StreamPublisher { conn, queue })
    }
}

#[async_trait]
impl QueuePublisher for StreamPublisher {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn publish(&self, payload: &Value) -> Result<(), PublishError> {
        let body = serde_json::to_string(payload)?;

        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.queue)
            .arg("*")
            .arg("payload")
            .arg(&body)
            .arg("attempts")
            .arg(0u32)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Broker {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })?;

        debug!(queue = %self.queue, %entry_id, "published message");
        Ok(())
    }
}
