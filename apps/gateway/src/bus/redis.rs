//! Cluster bus over Redis pub/sub.
//!
//! Room messages go to `{prefix}:room:{room}`; instance-wide messages
//! (`Everyone`, `Disconnect`) go to `{prefix}:control`. Outbound messages are
//! queued and sent by a single publisher task, so publishing never waits on
//! Redis and messages from one source keep their order. A single subscriber
//! task feeds everything received into an in-process broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BroadcastBus, BusMessage, BusPayload, BUS_CAPACITY};
use crate::error::GatewayError;

/// Messages waiting for the publisher task. Beyond this, new ones are dropped.
const PUBLISH_QUEUE: usize = 8192;

const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct RedisBus {
    queue: mpsc::Sender<BusMessage>,
    inbound: broadcast::Sender<Arc<BusMessage>>,
}

impl RedisBus {
    /// Connect and spawn the publisher and subscriber tasks. Both stop when
    /// `cancel` fires.
    pub async fn start(
        url: &str,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<(Self, Vec<JoinHandle<()>>), GatewayError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        let (queue, queue_rx) = mpsc::channel(PUBLISH_QUEUE);
        let (inbound, _) = broadcast::channel(BUS_CAPACITY);

        let tasks = vec![
            tokio::spawn(run_publisher(
                publisher,
                prefix.to_string(),
                queue_rx,
                cancel.clone(),
            )),
            tokio::spawn(run_subscriber(
                client,
                prefix.to_string(),
                inbound.clone(),
                cancel,
            )),
        ];

        Ok((Self { queue, inbound }, tasks))
    }
}

impl BroadcastBus for RedisBus {
    fn publish(&self, message: BusMessage) {
        match self.queue.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(origin = %dropped.origin, "bus publish queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("bus publisher stopped, dropping message");
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.inbound.subscribe()
    }
}

pub fn channel_for(prefix: &str, message: &BusMessage) -> String {
    match &message.payload {
        BusPayload::Room { room, .. } => format!("{prefix}:room:{room}"),
        BusPayload::Everyone { .. } | BusPayload::Disconnect { .. } => {
            format!("{prefix}:control")
        }
    }
}

async fn run_publisher(
    mut conn: ConnectionManager,
    prefix: String,
    mut queue: mpsc::Receiver<BusMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(m) => m,
                None => break,
            },
        };

        let channel = channel_for(&prefix, &message);
        let body = match serde_json::to_string(&message) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(?e, "failed to encode bus message");
                continue;
            }
        };
        if let Err(e) = conn.publish::<_, _, ()>(&channel, body).await {
            tracing::warn!(?e, %channel, "bus publish failed, message dropped");
        }
    }
    tracing::debug!("bus publisher stopped");
}

async fn run_subscriber(
    client: redis::Client,
    prefix: String,
    inbound: broadcast::Sender<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    let mut backoff = RESUBSCRIBE_BACKOFF_MIN;
    loop {
        match subscribe_once(&client, &prefix, &inbound, &cancel).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => {
                tracing::warn!("bus subscription ended, resubscribing");
                backoff = RESUBSCRIBE_BACKOFF_MIN;
            }
            Err(e) => {
                tracing::warn!(?e, backoff_ms = backoff.as_millis() as u64, "bus subscription failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
    }
    tracing::debug!("bus subscriber stopped");
}

async fn subscribe_once(
    client: &redis::Client,
    prefix: &str,
    inbound: &broadcast::Sender<Arc<BusMessage>>,
    cancel: &CancellationToken,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{prefix}:room:*")).await?;
    pubsub.subscribe(format!("{prefix}:control")).await?;
    tracing::info!(%prefix, "bus subscribed");

    let mut messages = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = messages.next() => match next {
                Some(m) => m,
                None => return Ok(()),
            },
        };

        let body: String = match msg.get_payload() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(?e, "unreadable bus payload");
                continue;
            }
        };
        match serde_json::from_str::<BusMessage>(&body) {
            Ok(message) => {
                let _ = inbound.send(Arc::new(message));
            }
            Err(e) => tracing::warn!(?e, channel = msg.get_channel_name(), "malformed bus message"),
        }
    }
}
