// In-process event fan-out with optional webhook delivery. Emission never
// blocks a scan or poll cycle: subscribers get a broadcast copy, webhook
// posts run on their own task and failures are only logged.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
pub struct PresenceUpdate {
    pub device_id: i32,
    pub device_name: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HardwareUpdate {
    pub hardware_id: i32,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Presence(PresenceUpdate),
    Hardware(HardwareUpdate),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl EventBus {
    pub fn new(webhook_url: Option<String>) -> EventBus {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        EventBus {
            sender,
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to subscribers and, when configured, POST the event as JSON to
    /// the webhook. Best-effort on both paths.
    pub fn emit(&self, event: EngineEvent) {
        // send only errs when nobody is subscribed, which is fine.
        let _ = self.sender.send(event.clone());

        if let Some(url) = self.webhook_url.clone() {
            let client = self.client.clone();
            tokio::spawn(async move {
                match client.post(&url).json(&event).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("webhook delivered to {}", url);
                    }
                    Ok(response) => {
                        warn!("webhook {} answered {}", url, response.status());
                    }
                    Err(e) => {
                        warn!("webhook delivery to {} failed: {}", url, e);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_emission_order() {
        let bus = EventBus::new(None);
        let mut receiver = bus.subscribe();

        bus.emit(EngineEvent::Presence(PresenceUpdate {
            device_id: 1,
            device_name: "Kaia's phone".to_string(),
            event_type: "arrived".to_string(),
            timestamp: Utc::now(),
            ip_address: Some("192.168.1.23".to_string()),
        }));
        bus.emit(EngineEvent::Hardware(HardwareUpdate {
            hardware_id: 2,
            name: "front door".to_string(),
            value: 1.0,
            unit: "state".to_string(),
            timestamp: Utc::now(),
        }));

        match receiver.recv().await.unwrap() {
            EngineEvent::Presence(update) => assert_eq!(update.event_type, "arrived"),
            other => panic!("unexpected event {:?}", other),
        }
        match receiver.recv().await.unwrap() {
            EngineEvent::Hardware(update) => assert_eq!(update.hardware_id, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let bus = EventBus::new(None);
        bus.emit(EngineEvent::Hardware(HardwareUpdate {
            hardware_id: 1,
            name: "sensor".to_string(),
            value: 0.0,
            unit: "state".to_string(),
            timestamp: Utc::now(),
        }));
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let event = EngineEvent::Presence(PresenceUpdate {
            device_id: 4,
            device_name: "laptop".to_string(),
            event_type: "left".to_string(),
            timestamp: Utc::now(),
            ip_address: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "presence");
        assert_eq!(value["event_type"], "left");
    }
}
