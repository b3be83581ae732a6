//! Driving loop for queue consumers.
//!
//! Each queue is a Redis Stream read through a consumer group shared by all
//! replicas, so a message is delivered to one consumer at a time and survives
//! until acknowledged (at-least-once). The runner owns everything the
//! consumers must not know about: group setup, stale-entry reclaim, attempt
//! counting, backoff between redeliveries, and the `<queue>:dlq` dead-letter
//! stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{Outcome, QueueConsumer, RetryPolicy};

/// How long one XREADGROUP blocks waiting for a message. Kept short so the
/// cancellation token is consulted at a bounded interval.
const READ_BLOCK_MS: u64 = 1000;

/// Entries left unacknowledged for this long belong to a consumer that died
/// mid-handle. Any replica may claim and reprocess them; until claimed they
/// sit in the dead consumer's pending list, invisible to `XREADGROUP >`.
const CLAIM_MIN_IDLE_MS: u64 = 60_000;

/// One raw message pulled off a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    payload: Vec<u8>,
    /// Deliveries already consumed by this logical message.
    attempts: u32,
}

/// What the runner must do with a message once the consumer's outcome and the
/// retry policy have been consulted.
#[derive(Debug, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue { attempts: u32, delay: Duration },
    DeadLetter { reason: String },
}

/// Pure outcome interpretation: the only place where `Retry` turns into
/// either a backoff requeue or a dead-letter once attempts run out.
fn settle_outcome(outcome: Outcome, attempts: u32, retry: &RetryPolicy) -> Settlement {
    match outcome {
        Outcome::Ack => Settlement::Ack,
        Outcome::Retry => {
            let next = attempts + 1;
            if retry.exhausted(next) {
                Settlement::DeadLetter {
                    reason: "retry attempts exhausted".to_string(),
                }
            } else {
                Settlement::Requeue {
                    attempts: next,
                    delay: retry.delay_for_attempt(next),
                }
            }
        }
        Outcome::Reject { reason } => Settlement::DeadLetter { reason },
    }
}

pub struct ConsumerRunner {
    client: redis::Client,
    group: String,
    retry: RetryPolicy,
}

impl ConsumerRunner {
    pub fn new(client: redis::Client, group: String, retry: RetryPolicy) -> Self {
        ConsumerRunner {
            client,
            group,
            retry,
        }
    }

    /// Pull messages for `consumer` until the token is cancelled. A message
    /// already pulled is always settled (ack / requeue / dead-letter) before
    /// shutdown completes; the token is consulted only between reads.
    ///
    /// Loss of broker connectivity at startup is fatal and surfaced to the
    /// caller; transient read errors afterwards are logged and retried.
    pub async fn run(
        self,
        consumer: Arc<dyn QueueConsumer>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let queue = consumer.queue_name().to_string();
        let dlq = format!("{queue}:dlq");
        let consumer_name = format!("{queue}-{}", uuid::Uuid::new_v4());

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        ensure_group(&mut conn, &queue, &self.group).await?;
        info!(%queue, group = %self.group, consumer = %consumer_name, "consumer started");

        while !token.is_cancelled() {
            let entry = match self.next_entry(&mut conn, &queue, &dlq, &consumer_name).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue, // blocking read timed out, no message
                Err(e) => {
                    error!(%queue, error = %e, "failed to read from queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if let Err(e) = self.settle(&mut conn, consumer.as_ref(), &queue, &dlq, entry).await {
                error!(%queue, error = %e, "failed to settle message");
            }
        }

        info!(%queue, "consumer stopped");
        Ok(())
    }

    /// Stale pending entries first (a crashed consumer's unacknowledged
    /// messages must be reprocessed, not stranded), then new messages.
    async fn next_entry(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        dlq: &str,
        consumer_name: &str,
    ) -> redis::RedisResult<Option<StreamEntry>> {
        let parsed = match self.claim_stale(conn, queue, consumer_name).await? {
            ParsedReply::Empty => self.read_new(conn, queue, consumer_name).await?,
            claimed => claimed,
        };

        match parsed {
            ParsedReply::Entry(entry) => Ok(Some(entry)),
            ParsedReply::Empty => Ok(None),
            ParsedReply::Unreadable(id) => {
                // No payload field: nothing to process or requeue, but the
                // entry still goes to the DLQ for operator inspection
                // instead of being silently discarded.
                warn!(%queue, entry_id = %id, "entry has no payload field, dead-lettering");
                redis::cmd("XADD")
                    .arg(dlq)
                    .arg("*")
                    .arg("entry_id")
                    .arg(&id)
                    .arg("reason")
                    .arg("missing payload field")
                    .arg("failed_at")
                    .arg(Utc::now().to_rfc3339())
                    .query_async::<_, String>(conn)
                    .await?;
                self.ack(conn, queue, &id).await?;
                Ok(None)
            }
        }
    }

    /// Claim one entry another consumer pulled but never acknowledged.
    async fn claim_stale(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer_name: &str,
    ) -> redis::RedisResult<ParsedReply> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.group)
            .arg(consumer_name)
            .arg(CLAIM_MIN_IDLE_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await?;
        Ok(parse_claim_reply(reply))
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        consumer_name: &str,
    ) -> redis::RedisResult<ParsedReply> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(READ_BLOCK_MS)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(conn)
            .await?;
        Ok(parse_read_reply(reply))
    }

    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &dyn QueueConsumer,
        queue: &str,
        dlq: &str,
        entry: StreamEntry,
    ) -> redis::RedisResult<()> {
        let outcome = consumer.handle(&entry.payload).await;
        match settle_outcome(outcome, entry.attempts, &self.retry) {
            Settlement::Ack => self.ack(conn, queue, &entry.id).await,
            Settlement::Requeue { attempts, delay } => {
                tokio::time::sleep(delay).await;
                self.requeue(conn, queue, &entry, attempts).await
            }
            Settlement::DeadLetter { reason } => {
                self.dead_letter(conn, queue, dlq, &entry, &reason).await
            }
        }
    }

    async fn ack(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        entry_id: &str,
    ) -> redis::RedisResult<()> {
        redis::cmd("XACK")
            .arg(queue)
            .arg(&self.group)
            .arg(entry_id)
            .query_async::<_, u64>(conn)
            .await?;
        Ok(())
    }

    /// Re-publish the message with its attempt count bumped, then ack the
    /// original so the pending list stays clean.
    async fn requeue(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        entry: &StreamEntry,
        attempts: u32,
    ) -> redis::RedisResult<()> {
        redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg("payload")
            .arg(&entry.payload)
            .arg("attempts")
            .arg(attempts)
            .query_async::<_, String>(conn)
            .await?;
        self.ack(conn, queue, &entry.id).await
    }

    async fn dead_letter(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        dlq: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> redis::RedisResult<()> {
        redis::cmd("XADD")
            .arg(dlq)
            .arg("*")
            .arg("payload")
            .arg(&entry.payload)
            .arg("reason")
            .arg(reason)
            .arg("attempts")
            .arg(entry.attempts)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .query_async::<_, String>(conn)
            .await?;
        warn!(%queue, entry_id = %entry.id, attempts = entry.attempts, reason, "message dead-lettered");
        self.ack(conn, queue, &entry.id).await
    }
}

/// Create the consumer group if it does not exist yet (idempotent).
async fn ensure_group(
    conn: &mut MultiplexedConnection,
    queue: &str,
    group: &str,
) -> anyhow::Result<()> {
    let result: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(queue)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedReply {
    Entry(StreamEntry),
    Empty,
    /// Entry id present but no payload field.
    Unreadable(String),
}

/// XREADGROUP reply shape: `[[stream_name, [[entry_id, [field, value, ...]]]]]`,
/// or Nil when the blocking read times out.
fn parse_read_reply(reply: Value) -> ParsedReply {
    let streams = match reply {
        Value::Bulk(streams) => streams,
        _ => return ParsedReply::Empty,
    };

    for stream in &streams {
        let parts = match stream {
            Value::Bulk(parts) => parts,
            _ => continue,
        };
        if let Some(Value::Bulk(entries)) = parts.get(1) {
            match parse_entries(entries) {
                ParsedReply::Empty => continue,
                parsed => return parsed,
            }
        }
    }

    ParsedReply::Empty
}

/// XAUTOCLAIM reply shape: `[next_cursor, [entries], ...]`.
fn parse_claim_reply(reply: Value) -> ParsedReply {
    let parts = match reply {
        Value::Bulk(parts) => parts,
        _ => return ParsedReply::Empty,
    };
    match parts.get(1) {
        Some(Value::Bulk(entries)) => parse_entries(entries),
        _ => ParsedReply::Empty,
    }
}

/// Entry shape: `[entry_id, [field, value, ...]]`.
fn parse_entries(entries: &[Value]) -> ParsedReply {
    for entry in entries {
        let pair = match entry {
            Value::Bulk(pair) => pair,
            _ => continue,
        };
        let id = match pair.first() {
            Some(Value::Data(raw)) => String::from_utf8_lossy(raw).to_string(),
            _ => continue,
        };
        let fields = match pair.get(1) {
            Some(Value::Bulk(fields)) => fields,
            _ => return ParsedReply::Unreadable(id),
        };

        let mut payload: Option<Vec<u8>> = None;
        let mut attempts = 0u32;
        for chunk in fields.chunks(2) {
            if let [Value::Data(key), Value::Data(value)] = chunk {
                match key.as_slice() {
                    b"payload" => payload = Some(value.clone()),
                    b"attempts" => attempts = String::from_utf8_lossy(value).parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        return match payload {
            Some(payload) => ParsedReply::Entry(StreamEntry {
                id,
                payload,
                attempts,
            }),
            None => ParsedReply::Unreadable(id),
        };
    }

    ParsedReply::Empty
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.0,
        }
    }

    fn data(raw: &[u8]) -> Value {
        Value::Data(raw.to_vec())
    }

    fn entry(id: &str, fields: Vec<Value>) -> Value {
        Value::Bulk(vec![data(id.as_bytes()), Value::Bulk(fields)])
    }

    fn read_reply(entries: Vec<Value>) -> Value {
        Value::Bulk(vec![Value::Bulk(vec![
            data(b"career_docs_response"),
            Value::Bulk(entries),
        ])])
    }

    #[test]
    fn test_settle_ack_passes_through() {
        assert_eq!(
            settle_outcome(Outcome::Ack, 3, &policy(5)),
            Settlement::Ack
        );
    }

    #[test]
    fn test_settle_retry_requeues_with_bumped_attempts_and_backoff() {
        let retry = policy(5);
        assert_eq!(
            settle_outcome(Outcome::Retry, 0, &retry),
            Settlement::Requeue {
                attempts: 1,
                delay: Duration::from_millis(100),
            }
        );
        assert_eq!(
            settle_outcome(Outcome::Retry, 2, &retry),
            Settlement::Requeue {
                attempts: 3,
                delay: Duration::from_millis(400),
            }
        );
    }

    #[test]
    fn test_settle_retry_dead_letters_once_attempts_run_out() {
        let retry = policy(3);
        // Third delivery of a retried message: 2 prior attempts, next is 3.
        assert_eq!(
            settle_outcome(Outcome::Retry, 2, &retry),
            Settlement::DeadLetter {
                reason: "retry attempts exhausted".to_string(),
            }
        );
    }

    #[test]
    fn test_settle_reject_dead_letters_with_its_reason() {
        assert_eq!(
            settle_outcome(
                Outcome::Reject {
                    reason: "malformed message: missing user_id".to_string(),
                },
                0,
                &policy(5),
            ),
            Settlement::DeadLetter {
                reason: "malformed message: missing user_id".to_string(),
            }
        );
    }

    #[test]
    fn test_unmatched_response_dead_letters_after_bounded_retries() {
        // A response whose context never appears keeps reporting Retry;
        // the runner must end that at the bound, never drop it silently.
        use crate::errors::ConsumeError;
        let retry = policy(3);

        let mut attempts = 0;
        loop {
            let outcome = Outcome::from(ConsumeError::CacheMiss("abc".into()));
            match settle_outcome(outcome, attempts, &retry) {
                Settlement::Requeue { attempts: next, .. } => attempts = next,
                Settlement::DeadLetter { reason } => {
                    assert_eq!(reason, "retry attempts exhausted");
                    break;
                }
                Settlement::Ack => panic!("cache miss must never ack"),
            }
            assert!(attempts <= 3, "retried past the bound");
        }
        assert_eq!(attempts, 2); // two requeues, dead-lettered on the third
    }

    #[test]
    fn test_parse_read_reply_extracts_payload_and_attempts() {
        let reply = read_reply(vec![entry(
            "1-0",
            vec![
                data(b"payload"),
                data(br#"{"correlation_id":"abc"}"#),
                data(b"attempts"),
                data(b"2"),
            ],
        )]);

        assert_eq!(
            parse_read_reply(reply),
            ParsedReply::Entry(StreamEntry {
                id: "1-0".to_string(),
                payload: br#"{"correlation_id":"abc"}"#.to_vec(),
                attempts: 2,
            })
        );
    }

    #[test]
    fn test_parse_read_reply_defaults_attempts_to_zero() {
        let reply = read_reply(vec![entry(
            "1-0",
            vec![data(b"payload"), data(b"{}")],
        )]);

        match parse_read_reply(reply) {
            ParsedReply::Entry(entry) => assert_eq!(entry.attempts, 0),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_read_reply_nil_means_timeout() {
        assert_eq!(parse_read_reply(Value::Nil), ParsedReply::Empty);
    }

    #[test]
    fn test_parse_read_reply_empty_entry_list() {
        assert_eq!(parse_read_reply(read_reply(vec![])), ParsedReply::Empty);
    }

    #[test]
    fn test_parse_read_reply_flags_entry_without_payload() {
        let reply = read_reply(vec![entry(
            "7-3",
            vec![data(b"attempts"), data(b"1")],
        )]);
        assert_eq!(
            parse_read_reply(reply),
            ParsedReply::Unreadable("7-3".to_string())
        );
    }

    #[test]
    fn test_parse_claim_reply_returns_reclaimed_entry() {
        // XAUTOCLAIM: [next_cursor, [entries], ...]
        let reply = Value::Bulk(vec![
            data(b"0-0"),
            Value::Bulk(vec![entry(
                "5-1",
                vec![data(b"payload"), data(b"{}"), data(b"attempts"), data(b"1")],
            )]),
        ]);

        assert_eq!(
            parse_claim_reply(reply),
            ParsedReply::Entry(StreamEntry {
                id: "5-1".to_string(),
                payload: b"{}".to_vec(),
                attempts: 1,
            })
        );
    }

    #[test]
    fn test_parse_claim_reply_with_nothing_pending() {
        let reply = Value::Bulk(vec![data(b"0-0"), Value::Bulk(vec![])]);
        assert_eq!(parse_claim_reply(reply), ParsedReply::Empty);
    }
}
