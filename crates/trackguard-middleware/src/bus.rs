//! Typed, topic-based publish/subscribe bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives every
//! message published to its topic without one subscriber blocking another.
//!
//! # Topics
//!
//! | Topic | Wire name | Traffic |
//! |---|---|---|
//! | [`Topic::Telemetry`] | `tracker/jonoprotocol` | Normalised telemetry events from the decoders |
//! | [`Topic::DeviceCommands`] | `tracker/send-imei` | Outbound vendor commands, routed by device id |
//! | [`Topic::DeviceAssign`] | `tracker/assign-imei2remoteaddr` | Device id → transport address associations |
//! | [`Topic::Alerts`] | `tracker/alerts` | Human-readable alert text |

use trackguard_types::{BusMessage, TrackError};
use tokio::sync::broadcast;

/// Default channel capacity per topic.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Routing topics on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    DeviceCommands,
    DeviceAssign,
    Alerts,
}

impl Topic {
    /// Name used by the external message broker for this lane.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Topic::Telemetry => "tracker/jonoprotocol",
            Topic::DeviceCommands => "tracker/send-imei",
            Topic::DeviceAssign => "tracker/assign-imei2remoteaddr",
            Topic::Alerts => "tracker/alerts",
        }
    }

    /// Inverse of [`Topic::wire_name`].
    pub fn from_wire_name(name: &str) -> Option<Topic> {
        [
            Topic::Telemetry,
            Topic::DeviceCommands,
            Topic::DeviceAssign,
            Topic::Alerts,
        ]
        .into_iter()
        .find(|t| t.wire_name() == name)
    }
}

/// Shared message bus. Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    telemetry: broadcast::Sender<BusMessage>,
    device_commands: broadcast::Sender<BusMessage>,
    device_assign: broadcast::Sender<BusMessage>,
    alerts: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Create a bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity);
        let (device_commands, _) = broadcast::channel(capacity);
        let (device_assign, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        Self {
            telemetry,
            device_commands,
            device_assign,
            alerts,
        }
    }

    /// Publish `message` on `topic`.
    ///
    /// Returns the number of receivers handed the message, or
    /// [`TrackError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, message: BusMessage) -> Result<usize, TrackError> {
        self.topic_sender(topic)
            .send(message)
            .map_err(|_| TrackError::Channel(format!("no subscribers for {}", topic.wire_name())))
    }

    /// Subscribe to a single topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<BusMessage> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::DeviceCommands => &self.device_commands,
            Topic::DeviceAssign => &self.device_assign,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicReceiver {
    /// Wait for the next message.
    ///
    /// `Lagged(n)` means this receiver fell behind and lost `n` messages;
    /// `Closed` means every sender is gone.
    pub async fn recv(&mut self) -> Result<BusMessage, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, used by tests and drain loops.
    pub fn try_recv(&mut self) -> Result<BusMessage, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackguard_types::{BusPayload, CommandMessage};

    fn command(imei: &str) -> BusMessage {
        BusMessage::new(
            "trackguard-middleware::test",
            BusPayload::DeviceCommand(CommandMessage {
                imei: imei.to_string(),
                payload: "31323334".into(),
                remote_addr: String::new(),
            }),
        )
    }

    #[tokio::test]
    async fn subscribers_on_same_topic_receive_same_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::DeviceCommands);
        let mut second = bus.subscribe_to(Topic::DeviceCommands);

        let msg = command("1");
        assert_eq!(bus.publish_to(Topic::DeviceCommands, msg.clone())?, 2);

        assert_eq!(first.recv().await?.id, msg.id);
        assert_eq!(second.recv().await?.id, msg.id);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let _commands = bus.subscribe_to(Topic::DeviceCommands);

        bus.publish_to(Topic::DeviceCommands, command("1"))?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "alerts subscriber must not see a device command");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_a_channel_error() {
        let bus = EventBus::default();
        let err = bus.publish_to(Topic::Telemetry, command("1")).unwrap_err();
        assert!(matches!(err, TrackError::Channel(_)));
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::DeviceCommands);
        for _ in 0..100 {
            let _ = bus.publish_to(Topic::DeviceCommands, command("flood"));
        }
        let result = slow.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[test]
    fn wire_names_round_trip() {
        for topic in [Topic::Telemetry, Topic::DeviceCommands, Topic::DeviceAssign, Topic::Alerts] {
            assert_eq!(Topic::from_wire_name(topic.wire_name()), Some(topic));
        }
        assert_eq!(Topic::from_wire_name("tracker/unknown"), None);
    }
}
