// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed facade over the durable message log.
//!
//! A [`Queue`] binds one topic to one payload type. Delivery is peek-then-
//! acknowledge: the consumer-group cursor only advances after the handler
//! returns Ok, so a crash mid-handling redelivers from the failed message
//! onward (at-least-once, in publication order).

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::CoreError;
use crate::storage::Storage;

/// Default batch size of one poll.
const POLL_BATCH: i64 = 64;

/// A decoded message with its log position.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// Position in the topic's total order.
    pub offset: i64,
    /// The decoded payload.
    pub message: T,
}

/// One delivery: a decoded message, or the decode failure for a row whose
/// payload did not parse. Malformed rows are still delivered so the handler
/// can record them before the cursor moves past.
pub type Delivery<T> = std::result::Result<Envelope<T>, CoreError>;

/// A typed handle on one topic.
pub struct Queue<T> {
    storage: Arc<dyn Storage>,
    topic: &'static str,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            topic: self.topic,
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Queue<T> {
    /// A queue handle for `topic`.
    pub fn new(storage: Arc<dyn Storage>, topic: &'static str) -> Self {
        Self {
            storage,
            topic,
            _payload: PhantomData,
        }
    }

    /// The topic this handle is bound to.
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Append a message. Returns its offset.
    pub async fn publish(
        &self,
        partition_key: Option<&str>,
        message: &T,
    ) -> Result<i64, CoreError> {
        let payload = serde_json::to_string(message)?;
        self.storage
            .publish(self.topic, partition_key, &payload)
            .await
    }

    /// Decode one raw payload into a delivery.
    pub fn decode(&self, offset: i64, payload: &str) -> Delivery<T> {
        serde_json::from_str(payload)
            .map(|message| Envelope { offset, message })
            .map_err(|e| CoreError::Malformed {
                topic: self.topic.to_string(),
                offset,
                details: e.to_string(),
            })
    }

    /// Poll one batch for `consumer_group`, decoded, cursor untouched.
    pub async fn poll_once(&self, consumer_group: &str) -> Result<Vec<Delivery<T>>, CoreError> {
        let items = self
            .storage
            .poll(self.topic, consumer_group, POLL_BATCH)
            .await?;
        Ok(items
            .into_iter()
            .map(|item| self.decode(item.offset, &item.payload))
            .collect())
    }

    /// Acknowledge everything up to and including `offset`.
    pub async fn ack(&self, consumer_group: &str, offset: i64) -> Result<(), CoreError> {
        self.storage.ack(self.topic, consumer_group, offset).await
    }

    /// Deliver messages to `handler` until shutdown.
    ///
    /// Each delivery is acknowledged individually once the handler returns
    /// Ok. A handler error stops the current batch without acknowledging,
    /// so the failed message and everything after it are redelivered on the
    /// next poll.
    pub async fn subscribe<F, Fut>(
        &self,
        consumer_group: &str,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) where
        F: Fn(Delivery<T>) -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        let mut interval = tokio::time::interval(poll_interval);
        info!(topic = self.topic, group = consumer_group, "queue consumer started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(topic = self.topic, group = consumer_group, "queue consumer stopping");
                        break;
                    }
                }

                _ = interval.tick() => {
                    let deliveries = match self.poll_once(consumer_group).await {
                        Ok(deliveries) => deliveries,
                        Err(e) => {
                            error!(topic = self.topic, error = %e, "queue poll failed");
                            continue;
                        }
                    };

                    for delivery in deliveries {
                        let offset = match &delivery {
                            Ok(envelope) => envelope.offset,
                            Err(CoreError::Malformed { offset, .. }) => *offset,
                            Err(_) => break,
                        };

                        match handler(delivery).await {
                            Ok(()) => {
                                if let Err(e) = self.ack(consumer_group, offset).await {
                                    error!(topic = self.topic, offset, error = %e, "ack failed");
                                    break;
                                }
                            }
                            Err(e) if e.is_retryable() => {
                                debug!(topic = self.topic, offset, error = %e, "handler deferred, will redeliver");
                                break;
                            }
                            Err(e) => {
                                error!(topic = self.topic, offset, error = %e, "handler failed, will redeliver");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    use crate::storage::SqliteStorage;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    async fn queue() -> Queue<Ping> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        Queue::new(Arc::new(SqliteStorage::new(pool)), "pings")
    }

    #[tokio::test]
    async fn typed_round_trip_in_order() {
        let queue = queue().await;
        queue.publish(None, &Ping { n: 1 }).await.unwrap();
        queue.publish(None, &Ping { n: 2 }).await.unwrap();

        let deliveries = queue.poll_once("test").await.unwrap();
        let messages: Vec<u32> = deliveries
            .into_iter()
            .map(|d| d.unwrap().message.n)
            .collect();
        assert_eq!(messages, vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_payload_is_delivered_as_error() {
        let queue = queue().await;
        queue.publish(None, &Ping { n: 1 }).await.unwrap();
        // Raw write bypassing the typed publish.
        queue
            .storage
            .publish("pings", None, "not json")
            .await
            .unwrap();

        let deliveries = queue.poll_once("test").await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[0].is_ok());

        match &deliveries[1] {
            Err(CoreError::Malformed { topic, .. }) => assert_eq!(topic, "pings"),
            other => panic!("expected malformed delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_acks_on_success_and_redelivers_on_failure() {
        let queue = queue().await;
        queue.publish(None, &Ping { n: 1 }).await.unwrap();
        queue.publish(None, &Ping { n: 2 }).await.unwrap();

        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = {
            let queue = queue.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                queue
                    .subscribe("test", Duration::from_millis(10), shutdown_rx, |delivery| {
                        let seen = seen.clone();
                        async move {
                            let envelope = delivery?;
                            let mut seen = seen.lock().unwrap();
                            // Fail n=2 once to force a redelivery.
                            if envelope.message.n == 2 && !seen.contains(&2) {
                                seen.push(2);
                                return Err(CoreError::DatabaseError {
                                    operation: "handler".to_string(),
                                    details: "transient".to_string(),
                                });
                            }
                            seen.push(envelope.message.n);
                            Ok(())
                        }
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap();

        // 1 handled once, 2 failed once and was redelivered.
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 2]);
    }
}
