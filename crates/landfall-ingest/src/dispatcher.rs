//! Per-notification entry point.
//!
//! | Basename | Where | Action |
//! |----------|-------|--------|
//! | success marker | outside `_backlog/`, unordered | claim, then submit directly |
//! | success marker | outside `_backlog/`, ordered | enqueue, then run the monitor |
//! | success marker | inside `_backlog/` | run the monitor |
//! | `_BACKFILL` | at the table prefix | run the subscriber |
//! | start-backfill gate | at the table prefix | post `_BACKFILL` |
//! | anything else | | ignore |

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::Instrument;

use landfall_core::StorageProvider;
use landfall_core::observability::ingest_span;

use crate::backlog::{self, BackfillMarker, Enqueued, PostOutcome};
use crate::claim;
use crate::config_resolver::ConfigResolver;
use crate::context::IngestContext;
use crate::error::{IngestError, Result};
use crate::job_id::job_id_for;
use crate::monitor::{MonitorOutcome, ensure_subscriber};
use crate::paths::{BACKFILL_FILENAME, basename, dirname, is_backlog_key};
use crate::submit::{self, AppliedJob};
use crate::subscriber::{SubscriberOutcome, run_subscriber};

/// Event type of an object creation or overwrite.
pub const FINALIZE_EVENT: &str = "OBJECT_FINALIZE";

/// An object-store notification reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Bucket of the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Notification event type, when the transport carries one.
    pub event_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Push { message: Message },
    Message(Message),
    Object(ObjectResource),
}

#[derive(Deserialize)]
struct Message {
    attributes: Attributes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attributes {
    bucket_id: String,
    object_id: String,
    #[serde(default)]
    event_type: Option<String>,
}

#[derive(Deserialize)]
struct ObjectResource {
    kind: String,
    bucket: String,
    name: String,
}

impl Notification {
    /// Creates a finalize notification for `bucket`/`key`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            event_type: None,
        }
    }

    /// Parses a Pub/Sub push envelope, a bare Pub/Sub message or a storage
    /// object resource.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::UnexpectedTrigger`] for any other payload.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(payload).map_err(|e| {
            IngestError::unexpected_trigger(format!("unrecognized notification payload: {e}"))
        })?;
        match envelope {
            Envelope::Push { message } | Envelope::Message(message) => Ok(Self {
                bucket: message.attributes.bucket_id,
                key: message.attributes.object_id,
                event_type: message.attributes.event_type,
            }),
            Envelope::Object(object) if object.kind == "storage#object" => {
                Ok(Self::new(object.bucket, object.name))
            }
            Envelope::Object(object) => Err(IngestError::unexpected_trigger(format!(
                "unsupported resource kind {}",
                object.kind
            ))),
        }
    }

    /// Returns true unless the transport says this is not a finalize event.
    #[must_use]
    pub fn is_finalize(&self) -> bool {
        self.event_type
            .as_deref()
            .is_none_or(|event| event == FINALIZE_EVENT)
    }
}

/// Classification of a notification by its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A producer's success marker.
    SuccessMarker,
    /// A backlog pointer.
    BacklogItem,
    /// A `_BACKFILL` marker.
    Backfill,
    /// The start-backfill gate.
    StartGate,
    /// Anything else.
    Ignored,
}

impl Trigger {
    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SuccessMarker => "success_marker",
            Self::BacklogItem => "backlog_item",
            Self::Backfill => "backfill",
            Self::StartGate => "start_gate",
            Self::Ignored => "ignored",
        }
    }
}

/// What handling a notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do for this object.
    Ignored,
    /// Unordered fast path: the marker's job was submitted.
    Applied(AppliedJob),
    /// Ordered mode: the marker was queued.
    Enqueued {
        /// Backlog write and `_BACKFILL` post.
        enqueued: Enqueued,
        /// Result of the follow-up monitor check.
        monitor: MonitorOutcome,
    },
    /// A backlog pointer notification ran the monitor.
    Monitored(MonitorOutcome),
    /// A subscriber ran.
    Subscriber(SubscriberOutcome),
    /// The start-backfill gate appeared.
    GateOpened(PostOutcome),
}

impl Outcome {
    /// Short description used in logs and HTTP responses.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Applied(_) => "applied",
            Self::Enqueued { .. } => "enqueued",
            Self::Monitored(_) => "monitored",
            Self::Subscriber(outcome) => outcome.as_str(),
            Self::GateOpened(_) => "gate_opened",
        }
    }
}

/// Routes notifications to the engine's components.
pub struct Dispatcher {
    ctx: IngestContext,
    storage: Arc<dyn StorageProvider>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(ctx: IngestContext, storage: Arc<dyn StorageProvider>) -> Self {
        Self { ctx, storage }
    }

    /// The engine context.
    #[must_use]
    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    /// Classifies `key` by its basename.
    #[must_use]
    pub fn classify(&self, key: &str) -> Trigger {
        let name = basename(key);
        if name == self.ctx.parser.success_filename() {
            if is_backlog_key(key) {
                Trigger::BacklogItem
            } else {
                Trigger::SuccessMarker
            }
        } else if name == BACKFILL_FILENAME {
            Trigger::Backfill
        } else if self.ctx.parser.gate_filename() == Some(name) {
            Trigger::StartGate
        } else {
            Trigger::Ignored
        }
    }

    /// Handles one notification.
    ///
    /// Recoverable errors ([`IngestError::is_recoverable`]) are logged at
    /// `info` and returned so the caller can end the invocation cleanly;
    /// everything else is logged once at `error`.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the invocation.
    pub async fn handle(&self, notification: &Notification) -> Result<Outcome> {
        let span = ingest_span(&notification.bucket, &notification.key);
        let trigger = if notification.is_finalize() {
            self.classify(&notification.key)
        } else {
            Trigger::Ignored
        };
        self.ctx.metrics.record_notification(trigger.as_str());

        let started = Instant::now();
        let result = self
            .dispatch(trigger, notification)
            .instrument(span.clone())
            .await;
        self.ctx
            .metrics
            .observe_invocation(trigger.as_str(), started.elapsed());

        span.in_scope(|| self.log_result(trigger, &result));
        result
    }

    fn log_result(&self, trigger: Trigger, result: &Result<Outcome>) {
        match result {
            Ok(outcome) => {
                tracing::info!(
                    trigger = trigger.as_str(),
                    outcome = outcome.as_str(),
                    "handled notification"
                );
            }
            Err(err @ IngestError::Duplicate { .. }) => {
                self.ctx.metrics.record_duplicate();
                tracing::info!(error = %err, "duplicate notification ignored");
            }
            Err(err) if err.is_recoverable() => {
                tracing::info!(error = %err, "invocation ended early");
            }
            Err(err) => {
                self.ctx.metrics.record_error(err.kind());
                tracing::error!(error = %err, kind = err.kind(), "notification handling failed");
            }
        }
    }

    async fn dispatch(&self, trigger: Trigger, notification: &Notification) -> Result<Outcome> {
        let key = notification.key.as_str();
        if trigger == Trigger::Ignored {
            tracing::debug!("ignoring object");
            return Ok(Outcome::Ignored);
        }
        let storage = self.storage.bucket(&notification.bucket)?;
        let storage = storage.as_ref();

        match trigger {
            Trigger::SuccessMarker => {
                let ordered = self.ctx.config.order_per_table
                    || ConfigResolver::new(storage).ordering_enabled(key).await?;
                if !ordered {
                    claim::claim(storage, key).await?;
                    let job_id = job_id_for(&self.ctx.config.job_prefix, key);
                    let applied = submit::apply(&self.ctx, storage, key, &job_id, None).await?;
                    return Ok(Outcome::Applied(applied));
                }
                let enqueued = backlog::enqueue(&self.ctx, storage, key).await?;
                let monitor = ensure_subscriber(&self.ctx, storage, &enqueued.table_prefix).await?;
                Ok(Outcome::Enqueued { enqueued, monitor })
            }
            Trigger::BacklogItem => {
                let table_prefix = self.ctx.parser.table_prefix(key)?;
                let monitor = ensure_subscriber(&self.ctx, storage, &table_prefix).await?;
                Ok(Outcome::Monitored(monitor))
            }
            Trigger::Backfill => {
                let table_prefix = self.at_table_prefix(key).ok_or_else(|| {
                    IngestError::unexpected_trigger(format!(
                        "{key} is not directly under a table prefix"
                    ))
                })?;
                let outcome = run_subscriber(&self.ctx, storage, table_prefix).await?;
                Ok(Outcome::Subscriber(outcome))
            }
            Trigger::StartGate => {
                let Some(table_prefix) = self.at_table_prefix(key) else {
                    return Ok(Outcome::Ignored);
                };
                let posted =
                    BackfillMarker::new(storage, table_prefix, self.ctx.parser.gate_filename())
                        .post()
                        .await?;
                Ok(Outcome::GateOpened(posted))
            }
            Trigger::Ignored => Ok(Outcome::Ignored),
        }
    }

    /// Returns the key's directory if it is exactly the table prefix the
    /// destination pattern resolves for it.
    fn at_table_prefix<'k>(&self, key: &'k str) -> Option<&'k str> {
        let dir = dirname(key);
        let destination = self.ctx.parser.destination(key).ok()?;
        (destination.table_prefix == dir).then_some(dir)
    }
}

#[cfg(test)]
mod tests {
    use landfall_core::MemoryProvider;

    use super::*;
    use crate::config::IngestConfig;
    use crate::warehouse::InMemoryWarehouse;

    fn dispatcher() -> Dispatcher {
        let ctx = IngestContext::new(
            IngestConfig {
                start_backfill_filename: Some("_HISTORYDONE".into()),
                ..IngestConfig::default()
            },
            Arc::new(InMemoryWarehouse::new()),
        )
        .expect("context");
        Dispatcher::new(ctx, Arc::new(MemoryProvider::new()))
    }

    #[test]
    fn parses_pubsub_push_envelope() {
        let payload = br#"{
            "message": {
                "attributes": {
                    "bucketId": "b",
                    "objectId": "d/t/_SUCCESS",
                    "eventType": "OBJECT_FINALIZE"
                },
                "messageId": "1"
            },
            "subscription": "projects/p/subscriptions/s"
        }"#;
        let notification = Notification::from_json(payload).expect("parse");
        assert_eq!(notification.bucket, "b");
        assert_eq!(notification.key, "d/t/_SUCCESS");
        assert!(notification.is_finalize());
    }

    #[test]
    fn parses_bare_message_and_object_resource() {
        let bare = br#"{"attributes": {"bucketId": "b", "objectId": "k", "eventType": "OBJECT_DELETE"}}"#;
        let notification = Notification::from_json(bare).expect("parse");
        assert!(!notification.is_finalize());

        let object = br#"{"kind": "storage#object", "bucket": "b", "name": "d/t/_SUCCESS"}"#;
        assert_eq!(
            Notification::from_json(object).expect("parse"),
            Notification::new("b", "d/t/_SUCCESS")
        );
    }

    #[test]
    fn rejects_unknown_payloads() {
        let payloads: [&[u8]; 3] = [
            br#"{"kind": "storage#bucket", "bucket": "b", "name": "x"}"#,
            br#"{"hello": "world"}"#,
            b"not json",
        ];
        for payload in payloads {
            assert!(matches!(
                Notification::from_json(payload),
                Err(IngestError::UnexpectedTrigger { .. })
            ));
        }
    }

    #[test]
    fn classifies_by_basename() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.classify("d/t/00/_SUCCESS"), Trigger::SuccessMarker);
        assert_eq!(dispatcher.classify("d/t/_backlog/00/_SUCCESS"), Trigger::BacklogItem);
        assert_eq!(dispatcher.classify("d/t/_BACKFILL"), Trigger::Backfill);
        assert_eq!(dispatcher.classify("d/t/_HISTORYDONE"), Trigger::StartGate);
        assert_eq!(dispatcher.classify("d/t/_bqlock"), Trigger::Ignored);
        assert_eq!(dispatcher.classify("d/t/00/data.csv"), Trigger::Ignored);
    }

    #[tokio::test]
    async fn backfill_below_table_prefix_is_unexpected() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .handle(&Notification::new("b", "d/t/00/_BACKFILL"))
            .await
            .expect_err("misplaced");
        assert!(matches!(err, IngestError::UnexpectedTrigger { .. }));
    }

    #[tokio::test]
    async fn delete_events_are_ignored() {
        let dispatcher = dispatcher();
        let mut notification = Notification::new("b", "d/t/_SUCCESS");
        notification.event_type = Some("OBJECT_DELETE".into());
        assert_eq!(
            dispatcher.handle(&notification).await.expect("handle"),
            Outcome::Ignored
        );
    }
}
