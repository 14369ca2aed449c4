use crate::metrics::Metrics;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum PushError {
    Gateway,
}

impl Display for PushError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gateway => write!(f, "push gateway failure"),
        }
    }
}

impl Error for PushError {}

/// Delivers wake-up notifications to offline recipients. Implementations are
/// best-effort; the router never waits on them.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn notify(&self, device_token: &str, sender_name: &str) -> Result<(), PushError>;
}

pub struct NullPush;

#[async_trait]
impl PushGateway for NullPush {
    async fn notify(&self, _device_token: &str, _sender_name: &str) -> Result<(), PushError> {
        Ok(())
    }
}

pub struct LogPush;

#[async_trait]
impl PushGateway for LogPush {
    async fn notify(&self, device_token: &str, sender_name: &str) -> Result<(), PushError> {
        debug!(target: "sotto::push", device = %device_token, sender = %sender_name, "push notification");
        Ok(())
    }
}

/// Captures notifications instead of delivering them. Test double.
#[derive(Default)]
pub struct RecordingPush {
    notified: Mutex<Vec<(String, String)>>,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<(String, String)> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn notify(&self, device_token: &str, sender_name: &str) -> Result<(), PushError> {
        let mut notified = self.notified.lock().await;
        notified.push((device_token.to_string(), sender_name.to_string()));
        Ok(())
    }
}

/// Fires a notification without blocking the caller. Failures are logged and
/// swallowed; delivery of the message itself never depends on the push lane.
pub fn dispatch(
    gateway: Arc<dyn PushGateway>,
    metrics: Arc<Metrics>,
    device_token: String,
    sender_name: String,
) {
    tokio::spawn(async move {
        match gateway.notify(&device_token, &sender_name).await {
            Ok(()) => metrics.mark_push(),
            Err(error) => warn!("push dispatch failed: {}", error),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_gateway_captures_notifications() {
        let gateway = RecordingPush::new();
        gateway.notify("device-1", "alice").await.unwrap();
        let notified = gateway.notifications().await;
        assert_eq!(notified, vec![("device-1".to_string(), "alice".to_string())]);
    }

    #[tokio::test]
    async fn dispatch_is_fire_and_forget() {
        let gateway = Arc::new(RecordingPush::new());
        let metrics = Arc::new(Metrics::new());
        dispatch(
            Arc::clone(&gateway) as Arc<dyn PushGateway>,
            Arc::clone(&metrics),
            "device-2".to_string(),
            "bob".to_string(),
        );
        tokio::task::yield_now().await;
        // The spawned task may need a beat to run.
        for _ in 0..64 {
            if !gateway.notifications().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.notifications().await.len(), 1);
    }
}
