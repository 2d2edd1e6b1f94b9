use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::integration::RawSample;
use crate::rest_store::RestClient;
use crate::store::Event;

const MAX_RETRIES: u32 = 3;

/// Isolated task polling one entity and forwarding samples with a new timestamp
pub struct SamplePoller {
    entity_id: String,
    client: RestClient,
    events: Sender<Event>,
    poll_interval: Duration,
    last_timestamp: Option<i64>,
}

impl SamplePoller {
    pub fn new(
        entity_id: String,
        client: RestClient,
        events: Sender<Event>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            entity_id,
            client,
            events,
            poll_interval,
            last_timestamp: None,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        debug!(entity = %self.entity_id, "starting sample poller");
        let mut read_interval = interval(self.poll_interval);
        read_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            read_interval.tick().await;

            match self.read_sample_with_retry().await {
                Ok(Some(sample)) => {
                    if self.last_timestamp == Some(sample.timestamp_ms) {
                        continue;
                    }
                    self.last_timestamp = Some(sample.timestamp_ms);
                    let event = Event::Sample {
                        entity_id: self.entity_id.clone(),
                        sample,
                    };
                    if self.events.send(event).await.is_err() {
                        info!(entity = %self.entity_id, "dispatcher gone, stopping sample poller");
                        break;
                    }
                }
                Ok(None) => debug!(entity = %self.entity_id, "entity has no state yet"),
                Err(e) => warn!(entity = %self.entity_id, "sample read failed: {e:#}"),
            }
        }
    }

    async fn read_sample_with_retry(&self) -> anyhow::Result<Option<RawSample>> {
        let mut attempt = 1;
        loop {
            match self.client.read_state(&self.entity_id).await {
                Ok(state) => return Ok(state.map(|state| state.to_sample())),
                Err(e) if attempt < MAX_RETRIES => {
                    debug!(
                        entity = %self.entity_id,
                        "read attempt {attempt} failed: {e}. Retrying..."
                    );
                    sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("all {MAX_RETRIES} attempts failed")));
                }
            }
        }
    }
}
