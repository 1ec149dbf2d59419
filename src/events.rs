//! 运行事件广播。观察者落后时丢弃旧事件，不阻塞请求路径。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProxyEvent {
    #[serde(rename_all = "camelCase")]
    StatusChange { running: bool },
    #[serde(rename_all = "camelCase")]
    Request {
        path: String,
        model: Option<String>,
        account_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        path: String,
        status: u16,
        success: bool,
        response_time_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// 没有订阅者时发送失败，忽略即可。
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscriber_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(ProxyEvent::StatusChange { running: true });
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ProxyEvent::Response {
            path: "/v1/chat/completions".to_string(),
            status: 200,
            success: true,
            response_time_ms: 120,
        });
        match rx.recv().await.expect("event") {
            ProxyEvent::Response { status, .. } => assert_eq!(status, 200),
            other => panic!("意外事件: {other:?}"),
        }
    }
}
