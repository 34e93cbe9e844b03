use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use super::EventBoundaryNotifier;
use crate::presence::PresenceState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Camera name -> event endpoint base URL (e.g. `http://nvr:7999/8084`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventEndpoints {
    endpoints: BTreeMap<String, Url>,
}

impl EventEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table, rejecting endpoints that are not http(s) URLs.
    pub fn from_map<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut table = Self::new();
        for (camera, endpoint) in entries {
            table.insert(camera, endpoint.as_ref())?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, camera: impl Into<String>, endpoint: &str) -> Result<()> {
        let camera = camera.into();
        let url = Url::parse(endpoint.trim())
            .with_context(|| format!("invalid event endpoint for camera {}", camera))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "event endpoint for camera {} uses unsupported scheme '{}'",
                    camera,
                    other
                ))
            }
        }
        self.endpoints.insert(camera, url);
        Ok(())
    }

    pub fn get(&self, camera: &str) -> Option<&Url> {
        self.endpoints.get(camera)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Requests sent for a transition, in order.
///
/// ON starts an event and pauses the endpoint's own motion detection; OFF ends
/// the event.
pub fn boundary_urls(endpoint: &Url, state: PresenceState) -> Vec<String> {
    let base = endpoint.as_str().trim_end_matches('/');
    match state {
        PresenceState::On => vec![
            format!("{}/action/eventstart", base),
            format!("{}/detection/pause", base),
        ],
        PresenceState::Off => vec![format!("{}/action/eventend", base)],
    }
}

/// Drives an HTTP recording controller from presence transitions.
pub struct HttpEventBoundaryNotifier {
    endpoints: EventEndpoints,
    agent: ureq::Agent,
}

impl HttpEventBoundaryNotifier {
    pub fn new(endpoints: EventEndpoints) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self { endpoints, agent }
    }

    pub fn endpoints(&self) -> &EventEndpoints {
        &self.endpoints
    }
}

impl EventBoundaryNotifier for HttpEventBoundaryNotifier {
    fn notify(&self, camera: &str, label: &str, state: PresenceState) -> Result<()> {
        let Some(endpoint) = self.endpoints.get(camera) else {
            log::warn!("no event endpoint configured for camera {}", camera);
            return Ok(());
        };
        for url in boundary_urls(endpoint, state) {
            self.agent
                .get(&url)
                .call()
                .with_context(|| format!("event endpoint request {}", url))?;
            log::info!("event {} sent for camera={} label={}: {}", state, camera, label, url);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_starts_event_and_pauses_detection() {
        let url = Url::parse("http://192.168.11.144:7999/8084").unwrap();
        assert_eq!(
            boundary_urls(&url, PresenceState::On),
            vec![
                "http://192.168.11.144:7999/8084/action/eventstart",
                "http://192.168.11.144:7999/8084/detection/pause",
            ]
        );
    }

    #[test]
    fn off_ends_event() {
        let url = Url::parse("http://nvr:7999/8081/").unwrap();
        assert_eq!(
            boundary_urls(&url, PresenceState::Off),
            vec!["http://nvr:7999/8081/action/eventend"]
        );
    }

    #[test]
    fn table_rejects_bad_endpoints() {
        assert!(EventEndpoints::from_map([("front", "not a url")]).is_err());
        assert!(EventEndpoints::from_map([("front", "ftp://nvr/1")]).is_err());
        let table = EventEndpoints::from_map([("front", "http://nvr:7999/8084")]).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get("back").is_none());
    }

    #[test]
    fn unknown_camera_is_skipped() {
        let notifier = HttpEventBoundaryNotifier::new(EventEndpoints::new());
        assert!(notifier
            .notify("garage", "person", PresenceState::On)
            .is_ok());
    }
}
