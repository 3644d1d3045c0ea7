//! Bulk-loads the marker set from the upstream events API on startup, and
//! reconciles against it again after every pub/sub resubscription so a
//! missed message window heals itself within one hydrate cycle.
//!
//! Applies through the same `Hub::apply_create_or_update`/`apply_delete`
//! entry points the Consumer uses (§4.D "Apply via the same code path as
//! C"), so downstream fan-out sees synthetic CREATE/UPDATE/DELETE events
//! indistinguishable from live bus traffic.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::{error, info, warn};

use crate::config::Config;
use crate::hub::Hub;
use crate::model::{ChangeEvent, MarkerId};
use crate::protocol::UpstreamRecord;

#[derive(Debug, thiserror::Error)]
pub enum HydrateError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("exhausted {0} retries fetching {1}")]
    RetriesExhausted(u32, String),
}

impl From<HydrateError> for crate::Error {
    fn from(err: HydrateError) -> Self {
        match err {
            HydrateError::Request(e) => crate::Error::Http(e),
            HydrateError::RetriesExhausted(n, msg) => {
                crate::Error::HydrateExhausted(format!("{} attempts: {}", n, msg))
            }
        }
    }
}

pub struct Hydrator {
    client: reqwest::Client,
    events_url: String,
    retries: u32,
}

impl Hydrator {
    pub fn new(config: &Config) -> Self {
        Hydrator {
            client: reqwest::Client::new(),
            events_url: config.upstream_events_url.clone(),
            retries: config.hydrate_retries,
        }
    }

    async fn fetch_once(&self) -> Result<Vec<UpstreamRecord>, reqwest::Error> {
        self.client
            .get(&self.events_url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<UpstreamRecord>>()
            .await
    }

    /// GET with bounded retries, exponential backoff starting at 2s, and
    /// jitter — per §5's "total retry budget (default 5 attempts,
    /// exponential backoff starting at 2s)".
    async fn fetch_with_retry(&self, hub: &Hub) -> Result<Vec<UpstreamRecord>, HydrateError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            hub.metrics
                .hydrate_attempts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            match self.fetch_once().await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    if attempt >= self.retries {
                        return Err(HydrateError::RetriesExhausted(self.retries, e.to_string()));
                    }
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(
                        "{:15.15}[x] {:20} hydrate attempt {}/{} failed: {}, retrying in {:?}",
                        "hydrator", "fetch-fail", attempt, self.retries, e, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Parses the upstream list, skipping records missing a coordinate
    /// (logged at warn per §7 "malformed upstream record").
    fn parse_records(&self, records: Vec<UpstreamRecord>) -> Vec<(MarkerId, crate::model::Coordinate, crate::model::Attributes)> {
        records
            .into_iter()
            .filter_map(|record| match record.coordinate() {
                Some(coordinate) => Some((MarkerId::from(record.id), coordinate, record.attributes)),
                None => {
                    let err = crate::Error::MalformedUpstream(format!("record {} missing/invalid coordinate", record.id));
                    warn!("{:15.15}[x] {:20} {}", "hydrator", "malformed", err);
                    None
                }
            })
            .collect()
    }

    /// Cold start: the store is empty, so every upstream record is
    /// necessarily a create and there is no one yet listening to fan out
    /// to — `Hub::bulk_load` is the fast path the spatial index's STR
    /// bulk-loader was built for.
    async fn hydrate_cold(&self, hub: &Hub) -> Result<(), HydrateError> {
        let records = self.fetch_with_retry(hub).await?;
        let parsed = self.parse_records(records);
        let markers = parsed
            .into_iter()
            .map(|(id, coordinate, attributes)| crate::model::Marker {
                id,
                coordinate,
                attributes,
                version: 1,
            })
            .collect::<Vec<_>>();
        info!(
            "{:15.15}[>] {:20} cold hydrate loaded {} markers",
            "hydrator", "bulk-load", markers.len()
        );
        hub.bulk_load(markers);
        Ok(())
    }

    /// Reconcile hydrate: diffs the fresh upstream list against the
    /// current store and replays the diff through the live apply path so
    /// fan-out happens exactly as for bus traffic (§4.D steps 3-4).
    async fn hydrate_reconcile(&self, hub: &Hub) -> Result<Vec<ChangeEvent>, HydrateError> {
        let records = self.fetch_with_retry(hub).await?;
        let parsed = self.parse_records(records);
        let upstream_ids: std::collections::HashSet<MarkerId> =
            parsed.iter().map(|(id, _, _)| id.clone()).collect();

        let mut events = Vec::new();

        for current in hub.snapshot_markers() {
            if !upstream_ids.contains(&current.id) {
                if let Some(event) = hub.apply_delete(current.id) {
                    events.push(event);
                }
            }
        }

        for (id, coordinate, attributes) in parsed {
            // Check content before applying: an unconditional
            // `apply_create_or_update` bumps `version` and rewrites the
            // store even for a row that didn't change, which would inflate
            // `version` by one on every reconcile cycle forever. Skip the
            // apply entirely when the upstream row matches what's stored.
            if let Some(existing) = hub.get_marker(&id) {
                let candidate = crate::model::Marker {
                    id: id.clone(),
                    coordinate,
                    attributes: attributes.clone(),
                    version: existing.version,
                };
                if existing.same_content(&candidate) {
                    continue;
                }
            }
            let event = hub.apply_create_or_update(id, coordinate, attributes);
            events.push(event);
        }

        Ok(events)
    }

    /// Startup hydrate: process fails with exit code 1 on exhaustion, per
    /// §5 "on exhaustion at startup, process exits with non-zero status".
    pub async fn hydrate_startup(&self, hub: &Arc<Hub>) -> crate::Result<()> {
        self.hydrate_cold(hub).await.map_err(Into::into)
    }

    /// Post-resubscribe reconcile: on exhaustion, log and let the caller
    /// schedule a retry rather than crash the process (§4.D).
    pub async fn hydrate_reconnect(&self, hub: &Arc<Hub>) -> Vec<ChangeEvent> {
        if hub.is_store_empty() {
            if let Err(e) = self.hydrate_cold(hub).await {
                error!(
                    "{:15.15}[x] {:20} reconcile cold hydrate failed: {}",
                    "hydrator", "reconcile-fail", e
                );
            }
            return Vec::new();
        }
        match self.hydrate_reconcile(hub).await {
            Ok(events) => events,
            Err(e) => {
                error!(
                    "{:15.15}[x] {:20} reconcile hydrate failed: {}",
                    "hydrator", "reconcile-fail", e
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Coordinate;
    use serde_json::json;

    fn cfg() -> Config {
        Config {
            listen_port: 8080,
            upstream_events_url: "http://localhost/events".to_string(),
            pubsub_host: "localhost".to_string(),
            pubsub_port: 6379,
            pubsub_password: None,
            batch_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(300),
            outbound_queue_cap: 256,
            hydrate_retries: 5,
        }
    }

    #[test]
    fn parse_records_skips_missing_coordinates() {
        let hydrator = Hydrator::new(&cfg());
        let records = vec![
            UpstreamRecord {
                id: "m1".to_string(),
                location: Some(crate::protocol::UpstreamLocation {
                    coordinates: [-73.99, 40.72],
                }),
                attributes: json!({"title": "a"}),
            },
            UpstreamRecord {
                id: "m2".to_string(),
                location: None,
                attributes: json!({}),
            },
        ];
        let parsed = hydrator.parse_records(records);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, MarkerId::from("m1"));
        assert_eq!(parsed[0].1, Coordinate::new(-73.99, 40.72).unwrap());
    }
}
