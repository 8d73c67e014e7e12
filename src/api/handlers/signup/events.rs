//! Signup lifecycle events.
//!
//! Handlers publish to an `EventBus`; the production bus fans out over a
//! `tokio::sync::broadcast` channel so observers (the event logger, and
//! anything else that subscribes) never block the request path.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SignupEvent {
    UserCreated { user_id: Uuid },
    UserConfirmed { user_id: Uuid },
    TokenRedeemed { user_id: Uuid, course_id: i64 },
}

impl SignupEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserCreated { .. } => "user_created",
            Self::UserConfirmed { .. } => "user_confirmed",
            Self::TokenRedeemed { .. } => "token_redeemed",
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: SignupEvent);
}

#[derive(Clone, Debug)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<SignupEvent>,
}

impl BroadcastEventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SignupEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: SignupEvent) {
        // No subscribers is fine; the event is dropped.
        if self.sender.send(event.clone()).is_err() {
            debug!(event = event.name(), "no event subscribers");
        }
    }
}

/// Log every published event until the bus is dropped.
pub fn spawn_event_logger(bus: &BroadcastEventBus) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => info!(event = event.name(), payload = %payload, "signup event"),
                    Err(err) => warn!(event = event.name(), "failed to serialize event: {err}"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
