use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::entity::EntitySettings;
use crate::integration::RawSample;
use crate::sample_poller::SamplePoller;
use crate::slots::{SlotKind, SlotValue};
use crate::store::{Event, StateStore};

/// Thin client for a Home Assistant style `/api/states` endpoint.
#[derive(Debug, Clone)]
pub struct RestClient {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(endpoint_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn state_url(&self, entity_id: &str) -> anyhow::Result<String> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No state store connection");
        }
        Ok(format!("{}/api/states/{}", self.endpoint_url, entity_id))
    }

    /// Reads the state of `entity_id`. Unknown entities yield `None`.
    pub async fn read_state(&self, entity_id: &str) -> anyhow::Result<Option<RestState>> {
        let response = self
            .client
            .get(self.state_url(entity_id)?)
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let state = response.error_for_status()?.json().await?;
        Ok(Some(state))
    }

    pub async fn write_state(
        &self,
        entity_id: &str,
        state: String,
        attributes: Map<String, Value>,
    ) -> anyhow::Result<()> {
        self.client
            .post(self.state_url(entity_id)?)
            .bearer_auth(&self.auth_token)
            .json(&json!({ "state": state, "attributes": attributes }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl RestState {
    pub fn to_sample(&self) -> RawSample {
        RawSample::new(self.state.clone(), self.last_updated.timestamp_millis())
    }

    fn to_slot_value(&self, slot: SlotKind) -> Option<SlotValue> {
        let state = self.state.trim();
        if slot.is_flag() {
            match state.to_ascii_lowercase().as_str() {
                "true" | "on" => Some(SlotValue::Flag(true)),
                "false" | "off" => Some(SlotValue::Flag(false)),
                _ => None,
            }
        } else {
            state.parse().ok().map(SlotValue::Number)
        }
    }
}

/// [`StateStore`] backed by a REST state API. Subscriptions poll the entity.
#[derive(Debug)]
pub struct RestStateStore {
    client: RestClient,
    poll_interval: Duration,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RestStateStore {
    pub fn new(client: RestClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            RestClient::new(&config.store_url, &config.store_token),
            config.poll_interval,
        )
    }

    /// Slot object ids can't contain further dots: `sensor.<device>_<suffix>`.
    pub fn slot_entity_id(entity: &EntitySettings, slot: SlotKind) -> String {
        format!("sensor.{}_{}", entity.device_name, slot.object_suffix())
    }
}

impl Drop for RestStateStore {
    fn drop(&mut self) {
        for (_, poller) in self
            .pollers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            poller.abort();
        }
    }
}

#[async_trait]
impl StateStore for RestStateStore {
    async fn get_sample(&self, entity_id: &str) -> anyhow::Result<Option<RawSample>> {
        Ok(self
            .client
            .read_state(entity_id)
            .await?
            .map(|state| state.to_sample()))
    }

    async fn read_slot(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
    ) -> anyhow::Result<Option<SlotValue>> {
        let state = self
            .client
            .read_state(&Self::slot_entity_id(entity, slot))
            .await?;
        Ok(state.and_then(|state| state.to_slot_value(slot)))
    }

    async fn write_value(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
        value: SlotValue,
    ) -> anyhow::Result<()> {
        let mut attributes = Map::new();
        attributes.insert(
            "friendly_name".into(),
            format!("{} {}", entity.display_name, slot.description()).into(),
        );
        if !slot.is_flag() {
            attributes.insert(
                "unit_of_measurement".into(),
                entity.target_unit.clone().into(),
            );
        }
        self.client
            .write_state(&Self::slot_entity_id(entity, slot), value.to_string(), attributes)
            .await
    }

    async fn subscribe(&self, entity_id: &str, events: Sender<Event>) -> anyhow::Result<()> {
        let poller = SamplePoller::new(
            entity_id.to_string(),
            self.client.clone(),
            events,
            self.poll_interval,
        )
        .spawn();
        let previous = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id.to_string(), poller);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, entity_id: &str) {
        let poller = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity_id);
        if let Some(poller) = poller {
            poller.abort();
        }
    }
}
