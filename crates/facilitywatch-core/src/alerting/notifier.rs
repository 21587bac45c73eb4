//! Notification delivery for alert events

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::RedisStreamer;
use crate::error::{Error, Result};
use crate::models::{AlertNotification, AlertPayload};

/// Push of alert events to a tenant's subscribers.
///
/// The engine never calls a sink directly; events go through a
/// [`NotificationDispatcher`], so a failed or stuck publish never delays or
/// undoes the state change it announces.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()>;
}

enum Dispatch {
    Publish(Uuid, AlertNotification),
    Flush(oneshot::Sender<()>),
}

/// Queues events for a background task that publishes them in order, each
/// bounded by a timeout.
///
/// The task is started on first use, so the dispatcher must be used from
/// within a Tokio runtime. A full queue drops the event.
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    capacity: usize,
    queue: OnceLock<mpsc::Sender<Dispatch>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher over `sink`
    pub fn new(sink: Arc<dyn NotificationSink>, timeout: Duration, capacity: usize) -> Self {
        Self {
            sink,
            timeout,
            capacity: capacity.max(1),
            queue: OnceLock::new(),
        }
    }

    /// Queue an event without waiting for delivery
    pub fn dispatch(&self, tenant_id: Uuid, notification: AlertNotification) {
        let kind = notification.kind();
        let alert_id = notification.alert().id;
        if let Err(e) = self.queue().try_send(Dispatch::Publish(tenant_id, notification)) {
            warn!(%tenant_id, %alert_id, kind, error = %e, "Dropping alert event");
            counter!("facilitywatch_notification_failures_total").increment(1);
        }
    }

    /// Wait until every event queued so far has been published or given up on
    pub async fn flush(&self) {
        let Some(queue) = self.queue.get() else {
            return;
        };
        let (done, delivered) = oneshot::channel();
        if queue.send(Dispatch::Flush(done)).await.is_ok() {
            let _ = delivered.await;
        }
    }

    fn queue(&self) -> &mpsc::Sender<Dispatch> {
        self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            tokio::spawn(deliver_queued(self.sink.clone(), self.timeout, rx));
            tx
        })
    }
}

async fn deliver_queued(
    sink: Arc<dyn NotificationSink>,
    timeout: Duration,
    mut rx: mpsc::Receiver<Dispatch>,
) {
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Publish(tenant_id, notification) => {
                let kind = notification.kind();
                let alert_id = notification.alert().id;
                let error = match tokio::time::timeout(timeout, sink.publish(tenant_id, notification)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => Error::Notification(format!("publish timed out after {timeout:?}")),
                };
                warn!(%tenant_id, %alert_id, kind, error = %error, "Failed to publish alert event");
                counter!("facilitywatch_notification_failures_total").increment(1);
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// In-process fan-out to WebSocket subscribers, one channel per tenant
pub struct BroadcastSink {
    channels: DashMap<Uuid, broadcast::Sender<AlertNotification>>,
    capacity: usize,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per tenant
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a tenant's events
    pub fn subscribe(&self, tenant_id: Uuid) -> broadcast::Receiver<AlertNotification> {
        self.channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Live subscribers for a tenant
    pub fn subscriber_count(&self, tenant_id: Uuid) -> usize {
        self.channels
            .get(&tenant_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()> {
        let Some(sender) = self.channels.get(&tenant_id) else {
            return Ok(());
        };

        // No receivers is not an error, nobody is listening yet
        if let Ok(delivered) = sender.send(notification) {
            debug!(%tenant_id, delivered, "Broadcast alert event");
        }
        Ok(())
    }
}

/// Publishes events on Redis pub/sub for other processes
pub struct RedisSink {
    streamer: RedisStreamer,
}

impl RedisSink {
    /// Create a Redis sink
    pub fn new(streamer: RedisStreamer) -> Self {
        Self { streamer }
    }
}

#[async_trait]
impl NotificationSink for RedisSink {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()> {
        let receivers = self.streamer.publish_alert(tenant_id, &notification).await?;
        debug!(%tenant_id, receivers, kind = notification.kind(), "Published alert to Redis");
        Ok(())
    }
}

/// Posts every event to an HTTP endpoint
pub struct WebhookSink {
    client: Client,
    url: Url,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    tenant_id: Uuid,
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a AlertPayload,
    sent_at: DateTime<Utc>,
}

impl WebhookSink {
    /// Create a webhook sink
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Notification(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()> {
        let payload = WebhookPayload {
            tenant_id,
            kind: notification.kind(),
            data: notification.alert(),
            sent_at: Utc::now(),
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!(
                "Webhook returned {status}: {body}"
            )));
        }

        info!(alert_id = %payload.data.id, url = %self.url, "Webhook notification sent");
        Ok(())
    }
}

/// Delivers each event to every inner sink; each failure is logged and the
/// first one is returned
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()> {
        let results = futures::future::join_all(
            self.sinks
                .iter()
                .map(|sink| sink.publish(tenant_id, notification.clone())),
        )
        .await;

        let mut first_error = None;
        for error in results.into_iter().filter_map(Result::err) {
            warn!(%tenant_id, kind = notification.kind(), error = %error, "Sink failed to publish");
            first_error.get_or_insert(error);
        }

        first_error.map_or(Ok(()), Err)
    }
}
