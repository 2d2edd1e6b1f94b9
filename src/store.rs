use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::entity::{EntityDescriptor, EntitySettings};
use crate::integration::RawSample;
use crate::slots::{SlotKind, SlotValue};

/// Notifications flowing into the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sample { entity_id: String, sample: RawSample },
    Enable { entity_id: String },
    Disable { entity_id: String },
    /// Unsubscribes every entity and ends the dispatcher loop.
    Shutdown,
}

/// Host environment holding the monitored readings and the persisted slots.
///
/// Writes must only return once the store acknowledged them.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get_sample(&self, entity_id: &str) -> anyhow::Result<Option<RawSample>>;

    async fn read_slot(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
    ) -> anyhow::Result<Option<SlotValue>>;

    async fn write_value(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
        value: SlotValue,
    ) -> anyhow::Result<()>;

    /// Forwards every new sample of `entity_id` as [`Event::Sample`]. A second
    /// subscription for the same entity replaces the first.
    async fn subscribe(&self, entity_id: &str, events: Sender<Event>) -> anyhow::Result<()>;

    async fn unsubscribe(&self, entity_id: &str);
}

/// Source of per-entity configuration.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn enabled_entities(&self) -> anyhow::Result<Vec<String>>;

    async fn get_config(&self, entity_id: &str) -> anyhow::Result<Option<EntityDescriptor>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot_key(device_name: &str, slot: SlotKind) -> String {
    format!("{device_name}.{}", slot.state_name())
}

/// State store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    samples: Mutex<HashMap<String, RawSample>>,
    slots: Mutex<HashMap<String, SlotValue>>,
    subscriptions: Mutex<HashMap<String, Sender<Event>>>,
    reject_writes: AtomicBool,
    rejected_slot: Mutex<Option<SlotKind>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new sample and notifies the entity's subscriber, if any.
    /// Returns whether a subscriber was notified.
    pub async fn publish_sample(&self, entity_id: &str, sample: RawSample) -> anyhow::Result<bool> {
        lock(&self.samples).insert(entity_id.to_string(), sample.clone());
        let subscriber = lock(&self.subscriptions).get(entity_id).cloned();
        match subscriber {
            Some(events) => {
                events
                    .send(Event::Sample {
                        entity_id: entity_id.to_string(),
                        sample,
                    })
                    .await
                    .map_err(|_| anyhow::anyhow!("subscriber of {entity_id} is gone"))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current value of a slot below `device_name`.
    pub fn slot(&self, device_name: &str, slot: SlotKind) -> Option<SlotValue> {
        lock(&self.slots).get(&slot_key(device_name, slot)).copied()
    }

    pub fn set_slot(&self, device_name: &str, slot: SlotKind, value: SlotValue) {
        lock(&self.slots).insert(slot_key(device_name, slot), value);
    }

    pub fn is_subscribed(&self, entity_id: &str) -> bool {
        lock(&self.subscriptions).contains_key(entity_id)
    }

    /// Makes every following write fail until called again with `false`.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    /// Makes writes to `slot` fail, leaving the other slots writable.
    pub fn reject_writes_to(&self, slot: Option<SlotKind>) {
        *lock(&self.rejected_slot) = slot;
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_sample(&self, entity_id: &str) -> anyhow::Result<Option<RawSample>> {
        Ok(lock(&self.samples).get(entity_id).cloned())
    }

    async fn read_slot(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
    ) -> anyhow::Result<Option<SlotValue>> {
        Ok(self.slot(&entity.device_name, slot))
    }

    async fn write_value(
        &self,
        entity: &EntitySettings,
        slot: SlotKind,
        value: SlotValue,
    ) -> anyhow::Result<()> {
        if self.reject_writes.load(Ordering::Relaxed) || *lock(&self.rejected_slot) == Some(slot) {
            anyhow::bail!("store rejected write to {slot}");
        }
        self.set_slot(&entity.device_name, slot, value);
        Ok(())
    }

    async fn subscribe(&self, entity_id: &str, events: Sender<Event>) -> anyhow::Result<()> {
        lock(&self.subscriptions).insert(entity_id.to_string(), events);
        Ok(())
    }

    async fn unsubscribe(&self, entity_id: &str) {
        lock(&self.subscriptions).remove(entity_id);
    }
}

/// Registry over a fixed set of descriptors, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    entities: RwLock<HashMap<String, EntityDescriptor>>,
}

impl StaticRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Self {
        let entities = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.id.clone(), descriptor))
            .collect();
        Self {
            entities: RwLock::new(entities),
        }
    }

    /// Reads a JSON array of descriptors.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading entity file {}", path.display()))?;
        let descriptors: Vec<EntityDescriptor> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing entity file {}", path.display()))?;
        Ok(Self::new(descriptors))
    }

    pub fn upsert(&self, descriptor: EntityDescriptor) {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.id.clone(), descriptor);
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn enabled_entities(&self) -> anyhow::Result<Vec<String>> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        let mut enabled: Vec<_> = entities
            .values()
            .filter(|descriptor| descriptor.is_enabled())
            .map(|descriptor| descriptor.id.clone())
            .collect();
        enabled.sort();
        Ok(enabled)
    }

    async fn get_config(&self, entity_id: &str) -> anyhow::Result<Option<EntityDescriptor>> {
        Ok(self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned())
    }
}
