use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client};

use super::Notifier;
use crate::presence::PresenceState;

/// Publishes presence over MQTT.
///
/// - `{prefix}/{camera}/{label}`: `ON` / `OFF`, not retained
/// - `{prefix}/{camera}/{label}/snapshot`: JPEG of the best frame, retained
///
/// Requests are queued without waiting. When the client queue is full (broker
/// down or connection not polled) the publish fails and the dispatcher logs it,
/// so ingestion never stalls on the broker.
pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
}

impl MqttNotifier {
    pub fn new(client: Client, topic_prefix: impl Into<String>) -> Self {
        Self {
            client,
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn state_topic(&self, camera: &str, label: &str) -> String {
        format!("{}/{}/{}", self.topic_prefix, camera, label)
    }

    pub fn snapshot_topic(&self, camera: &str, label: &str) -> String {
        format!("{}/snapshot", self.state_topic(camera, label))
    }
}

impl Notifier for MqttNotifier {
    fn publish(
        &self,
        camera: &str,
        label: &str,
        state: PresenceState,
        snapshot: Option<&[u8]>,
    ) -> Result<()> {
        let topic = self.state_topic(camera, label);
        self.client
            .try_publish(
                topic.clone(),
                QoS::AtLeastOnce,
                false,
                state.as_str().as_bytes().to_vec(),
            )
            .with_context(|| format!("MQTT request queue rejected {}", topic))?;
        if let Some(jpeg) = snapshot {
            let topic = self.snapshot_topic(camera, label);
            self.client
                .try_publish(topic.clone(), QoS::AtLeastOnce, true, jpeg.to_vec())
                .with_context(|| format!("MQTT request queue rejected {}", topic))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::MqttOptions;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn topics_follow_prefix_camera_label() {
        let (client, _connection) = Client::new(MqttOptions::new("test", "127.0.0.1", 1883), 10);
        let notifier = MqttNotifier::new(client, "frigate");
        assert_eq!(notifier.state_topic("front", "person"), "frigate/front/person");
        assert_eq!(
            notifier.snapshot_topic("front", "person"),
            "frigate/front/person/snapshot"
        );
    }

    #[test]
    fn full_request_queue_fails_instead_of_blocking() {
        let (client, connection) = Client::new(MqttOptions::new("test", "127.0.0.1", 1883), 10);
        let notifier = MqttNotifier::new(client, "frigate");
        let (done_tx, done_rx) = mpsc::channel();

        // Nothing polls the connection, so the request queue never drains.
        std::thread::spawn(move || {
            let failures = (0..40)
                .filter(|i| {
                    let label = format!("label{}", i);
                    notifier
                        .publish("front", &label, PresenceState::On, None)
                        .is_err()
                })
                .count();
            let _ = done_tx.send(failures);
        });

        let failures = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("publish blocked on a full queue");
        assert_eq!(failures, 30);
        drop(connection);
    }
}
