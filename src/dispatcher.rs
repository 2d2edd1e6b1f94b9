use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::entity::{CalcMemory, EntityConfig, EntitySettings};
use crate::error::{ConfigError, EngineError};
use crate::integration::{RawSample, Sample};
use crate::policy::{self, CycleKind};
use crate::readiness::Readiness;
use crate::slots::SlotKind;
use crate::store::{Event, Registry, StateStore};
use crate::units::UnitTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Initialisation has not settled yet.
    NotReady,
    /// No initialised entity with this id.
    NotInitialised,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    Applied(CycleKind),
    Dropped(DropReason),
}

/// Owns all initialised entities and runs every sample through integration and
/// the accumulation policy, one at a time.
pub struct Dispatcher<S, R> {
    store: Arc<S>,
    registry: Arc<R>,
    units: &'static UnitTable,
    readiness: Readiness,
    events: Sender<Event>,
    entities: HashMap<String, EntityConfig>,
    restore_totals: bool,
}

impl<S: StateStore, R: Registry> Dispatcher<S, R> {
    /// `events` is handed to the store for every subscription; its receiving
    /// end is what [`Dispatcher::run`] consumes.
    pub fn new(
        store: Arc<S>,
        registry: Arc<R>,
        readiness: Readiness,
        events: Sender<Event>,
        restore_totals: bool,
    ) -> Self {
        Self {
            store,
            registry,
            units: UnitTable::global(),
            readiness,
            events,
            entities: HashMap::new(),
            restore_totals,
        }
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityConfig> {
        self.entities.get(entity_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    async fn load_settings(&self, entity_id: &str) -> Result<EntitySettings, EngineError> {
        let descriptor = match self.registry.get_config(entity_id).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                return Err(ConfigError::NotFound {
                    entity: entity_id.to_string(),
                }
                .into())
            }
            Err(e) => {
                warn!(entity = %entity_id, "registry lookup failed: {e:#}");
                return Err(ConfigError::NotFound {
                    entity: entity_id.to_string(),
                }
                .into());
            }
        };
        EntitySettings::from_descriptor(&descriptor, self.units)
    }

    async fn restore_memory(&self, settings: &EntitySettings) -> CalcMemory {
        if !self.restore_totals {
            return CalcMemory::default();
        }
        let temporary = self.store.read_slot(settings, SlotKind::Temporary).await;
        let reset_mode = self.store.read_slot(settings, SlotKind::ResetMode).await;
        match (temporary, reset_mode) {
            (Ok(temporary), Ok(reset_mode)) => {
                let memory = CalcMemory::restored(
                    temporary.and_then(|value| value.as_number()),
                    reset_mode.and_then(|value| value.as_flag()),
                );
                debug!(entity = %settings.entity_id, ?memory, "restored totals");
                memory
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(entity = %settings.entity_id, "cannot restore totals, starting from zero: {e:#}");
                CalcMemory::default()
            }
        }
    }

    /// Loads the entity's configuration, runs a first calculation with its
    /// current sample and subscribes to further samples. On failure the entity
    /// is left disabled.
    ///
    /// An entity that is already tracked picks up its new settings and keeps
    /// its running totals and baseline.
    pub async fn initialize(&mut self, entity_id: &str) -> Result<(), EngineError> {
        let settings = match self.load_settings(entity_id).await {
            Ok(settings) => settings,
            Err(e) => {
                self.disable(entity_id).await;
                return Err(e);
            }
        };
        debug!(entity = %entity_id, ?settings, "initialising");

        let memory = match self.entities.remove(entity_id) {
            Some(tracked) => tracked.memory,
            None => self.restore_memory(&settings).await,
        };
        self.entities
            .insert(entity_id.to_string(), EntityConfig::new(settings, memory));

        match self.store.get_sample(entity_id).await {
            Ok(Some(sample)) => {
                if let Err(e) = self.process(entity_id, &sample).await {
                    warn!(entity = %entity_id, ?sample, "first calculation failed: {e}");
                }
            }
            Ok(None) => debug!(entity = %entity_id, "no current sample"),
            Err(e) => warn!(entity = %entity_id, "cannot read current sample: {e:#}"),
        }

        if let Err(source) = self.store.subscribe(entity_id, self.events.clone()).await {
            self.entities.remove(entity_id);
            return Err(EngineError::Subscription {
                entity: entity_id.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Forgets the entity and stops its subscription. Returns whether it was
    /// initialised.
    pub async fn disable(&mut self, entity_id: &str) -> bool {
        self.store.unsubscribe(entity_id).await;
        let removed = self.entities.remove(entity_id).is_some();
        if removed {
            info!(entity = %entity_id, "disabled consumption tracking");
        }
        removed
    }

    /// Handles a notification. Samples arriving before the readiness barrier
    /// opened, or for unknown entities, are dropped rather than queued.
    pub async fn on_sample(
        &mut self,
        entity_id: &str,
        sample: &RawSample,
    ) -> Result<Dispatch, EngineError> {
        if !self.readiness.is_ready() {
            debug!(entity = %entity_id, ?sample, "not ready, sample dropped");
            return Ok(Dispatch::Dropped(DropReason::NotReady));
        }
        if !self.entities.contains_key(entity_id) {
            debug!(entity = %entity_id, ?sample, "entity not initialised, sample dropped");
            return Ok(Dispatch::Dropped(DropReason::NotInitialised));
        }
        self.process(entity_id, sample).await.map(Dispatch::Applied)
    }

    /// One calculation cycle. Memory is committed only after every write of
    /// the cycle was acknowledged. Writes are not transactional: a write failing
    /// halfway through a reset leaves the slots written before it in place,
    /// with the temporary slot always going first.
    async fn process(&mut self, entity_id: &str, raw: &RawSample) -> Result<CycleKind, EngineError> {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return Err(ConfigError::NotFound {
                entity: entity_id.to_string(),
            }
            .into());
        };

        let sample = Sample::parse(entity_id, raw)?;
        let cycle = policy::apply(entity, sample)?;

        for write in &cycle.writes {
            self.store
                .write_value(&entity.settings, write.slot, write.value)
                .await
                .map_err(|source| EngineError::StoreWriteFailure {
                    entity: entity_id.to_string(),
                    slot: write.slot,
                    source,
                })?;
        }
        entity.memory = cycle.memory;

        debug!(entity = %entity_id, ?sample, kind = ?cycle.kind, "cycle applied");
        Ok(cycle.kind)
    }

    /// Handles one event, logging failures. Returns false once the loop should stop.
    pub async fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Sample { entity_id, sample } => {
                match self.on_sample(&entity_id, &sample).await {
                    Ok(Dispatch::Applied(CycleKind::Reset { flushed, discarded })) => {
                        info!(entity = %entity_id, flushed, discarded, "reset, consumption persisted");
                    }
                    Ok(_) => {}
                    Err(e) if e.disables_entity() => {
                        error!(entity = %entity_id, "{e}");
                        self.disable(&entity_id).await;
                    }
                    Err(e) => {
                        let settings = self.entities.get(&entity_id).map(|entity| &entity.settings);
                        warn!(entity = %entity_id, ?sample, ?settings, "cycle skipped: {e}");
                    }
                }
                true
            }
            Event::Enable { entity_id } => {
                match self.initialize(&entity_id).await {
                    Ok(()) => info!(entity = %entity_id, "enabled consumption tracking"),
                    Err(e) => error!(entity = %entity_id, "cannot enable: {e}"),
                }
                true
            }
            Event::Disable { entity_id } => {
                self.disable(&entity_id).await;
                true
            }
            Event::Shutdown => {
                let entity_ids: Vec<_> = self.entities.keys().cloned().collect();
                for entity_id in entity_ids {
                    self.store.unsubscribe(&entity_id).await;
                }
                self.entities.clear();
                false
            }
        }
    }

    /// Consumes events until [`Event::Shutdown`]. The dispatcher holds a sender
    /// for new subscriptions itself, so the channel never closes on its own.
    pub async fn run(mut self, mut events: Receiver<Event>) {
        debug!("dispatcher loop started");
        while let Some(event) = events.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        info!("dispatcher loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CustomSettings, EntityDescriptor};
    use crate::readiness::readiness;
    use crate::slots::SlotValue;
    use crate::store::{InMemoryStore, StaticRegistry};
    use tokio::sync::mpsc;

    const HOUR_MS: i64 = 3_600_000;

    fn descriptor(id: &str, unit: &str, start_value: Option<f64>) -> EntityDescriptor {
        EntityDescriptor {
            id: id.to_string(),
            unit: Some(unit.to_string()),
            custom: Some(CustomSettings {
                enabled: true,
                start_value,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        registry: Arc<StaticRegistry>,
        dispatcher: Dispatcher<InMemoryStore, StaticRegistry>,
        _events: Receiver<Event>,
    }

    fn harness(descriptors: Vec<EntityDescriptor>, ready: bool) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(StaticRegistry::new(descriptors));
        let (gate, readiness) = readiness();
        if ready {
            gate.open();
        }
        let (tx, rx) = mpsc::channel(32);
        Harness {
            store: store.clone(),
            registry: registry.clone(),
            dispatcher: Dispatcher::new(store, registry, readiness, tx, false),
            _events: rx,
        }
    }

    fn temporary(store: &InMemoryStore, device: &str) -> f64 {
        store
            .slot(device, SlotKind::Temporary)
            .and_then(SlotValue::as_number)
            .expect("temporary slot should be written")
    }

    #[tokio::test]
    async fn test_accumulates_and_writes_temporary_slot() {
        let mut h = harness(vec![descriptor("sensor.tv", "W", None)], true);
        h.dispatcher.initialize("sensor.tv").await.unwrap();
        assert!(h.store.is_subscribed("sensor.tv"));

        h.dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, 0))
            .await
            .unwrap();
        let result = h
            .dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, HOUR_MS))
            .await
            .unwrap();
        assert!(matches!(result, Dispatch::Applied(CycleKind::Accumulated { .. })));
        assert!((temporary(&h.store, "sensor_tv") - 0.1).abs() < 1e-12);
        assert_eq!(h.store.slot("sensor_tv", SlotKind::Cumulative), None);
    }

    #[tokio::test]
    async fn test_first_calculation_uses_current_sample() {
        let mut h = harness(vec![descriptor("sensor.tv", "W", None)], false);
        h.store
            .publish_sample("sensor.tv", RawSample::new(60.0, 1_000))
            .await
            .unwrap();
        h.dispatcher.initialize("sensor.tv").await.unwrap();

        let memory = &h.dispatcher.entity("sensor.tv").unwrap().memory;
        assert_eq!(memory.previous_reading_watt, Some(60.0));
        assert_eq!(memory.previous_reading_ts, Some(1_000));
        assert_eq!(temporary(&h.store, "sensor_tv"), 0.0);
    }

    #[tokio::test]
    async fn test_samples_dropped_until_ready() {
        let mut h = harness(vec![descriptor("sensor.tv", "W", None)], false);
        h.dispatcher.initialize("sensor.tv").await.unwrap();
        let result = h
            .dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, 0))
            .await
            .unwrap();
        assert_eq!(result, Dispatch::Dropped(DropReason::NotReady));
        assert_eq!(
            h.dispatcher.entity("sensor.tv").unwrap().memory,
            CalcMemory::default()
        );
    }

    #[tokio::test]
    async fn test_unknown_entity_is_dropped() {
        let mut h = harness(vec![], true);
        let result = h
            .dispatcher
            .on_sample("sensor.nope", &RawSample::new(1.0, 0))
            .await
            .unwrap();
        assert_eq!(result, Dispatch::Dropped(DropReason::NotInitialised));
    }

    #[tokio::test]
    async fn test_misconfigured_entity_is_not_initialised() {
        let mut h = harness(
            vec![descriptor("sensor.meter", "kWh", None), descriptor("sensor.ok", "W", None)],
            true,
        );
        let err = h.dispatcher.initialize("sensor.meter").await.unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::UnsupportedUnit { .. })));
        assert!(h.dispatcher.entity("sensor.meter").is_none());
        assert!(!h.store.is_subscribed("sensor.meter"));

        let err = h.dispatcher.initialize("sensor.ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::NotFound { .. })));

        // Other entities are unaffected
        h.dispatcher.initialize("sensor.ok").await.unwrap();
        assert_eq!(h.dispatcher.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_sample_keeps_state() {
        let mut h = harness(vec![descriptor("sensor.tv", "W", None)], true);
        h.dispatcher.initialize("sensor.tv").await.unwrap();
        h.dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, 0))
            .await
            .unwrap();
        let before = h.dispatcher.entity("sensor.tv").unwrap().clone();

        let err = h
            .dispatcher
            .on_sample("sensor.tv", &RawSample::new("unavailable", HOUR_MS))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSample { .. }));
        assert!(!err.disables_entity());
        assert_eq!(h.dispatcher.entity("sensor.tv").unwrap(), &before);
    }

    #[tokio::test]
    async fn test_failed_write_is_reported_and_not_committed() {
        let mut h = harness(vec![descriptor("sensor.tv", "W", None)], true);
        h.dispatcher.initialize("sensor.tv").await.unwrap();
        h.dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, 0))
            .await
            .unwrap();
        let before = h.dispatcher.entity("sensor.tv").unwrap().clone();

        h.store.reject_writes(true);
        let err = h
            .dispatcher
            .on_sample("sensor.tv", &RawSample::new(100.0, HOUR_MS))
            .await
            .unwrap_err();
        match err {
            EngineError::StoreWriteFailure { entity, slot, .. } => {
                assert_eq!(entity, "sensor.tv");
                assert_eq!(slot, SlotKind::Temporary);
            }
            other => panic!("Expected StoreWriteFailure, got {other:?}"),
        }
        assert_eq!(h.dispatcher.entity("sensor.tv").unwrap(), &before);
    }

    #[tokio::test]
    async fn test_restores_totals_when_enabled() {
        let store = Arc::new(InMemoryStore::new());
        store.set_slot("sensor_tv", SlotKind::Temporary, SlotValue::Number(2.5));
        store.set_slot("sensor_tv", SlotKind::ResetMode, SlotValue::Flag(true));
        let registry = Arc::new(StaticRegistry::new([descriptor("sensor.tv", "W", None)]));
        let (gate, readiness) = readiness();
        gate.open();
        let (tx, _rx) = mpsc::channel(8);
        let mut dispatcher = Dispatcher::new(store.clone(), registry, readiness, tx, true);

        dispatcher.initialize("sensor.tv").await.unwrap();
        dispatcher
            .on_sample("sensor.tv", &RawSample::new(1000.0, 0))
            .await
            .unwrap();
        dispatcher
            .on_sample("sensor.tv", &RawSample::new(1000.0, HOUR_MS))
            .await
            .unwrap();

        assert!((temporary(&store, "sensor_tv") - 3.5).abs() < 1e-12);
        assert_eq!(
            store.slot("sensor_tv", SlotKind::ResetMode),
            Some(SlotValue::Flag(false))
        );
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_everything() {
        let mut h = harness(
            vec![descriptor("sensor.a", "W", None), descriptor("sensor.b", "W", None)],
            true,
        );
        h.dispatcher.initialize("sensor.a").await.unwrap();
        h.dispatcher.initialize("sensor.b").await.unwrap();

        assert!(h
            .dispatcher
            .handle(Event::Disable {
                entity_id: "sensor.a".into()
            })
            .await);
        assert!(!h.store.is_subscribed("sensor.a"));
        assert!(h.store.is_subscribed("sensor.b"));

        assert!(!h.dispatcher.handle(Event::Shutdown).await);
        assert!(!h.store.is_subscribed("sensor.b"));
        assert_eq!(h.dispatcher.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_enabling_tracked_entity_keeps_totals() {
        let mut h = harness(vec![descriptor("sensor.oven", "W", None)], true);
        h.dispatcher.initialize("sensor.oven").await.unwrap();
        for timestamp_ms in [0, HOUR_MS] {
            h.dispatcher
                .on_sample("sensor.oven", &RawSample::new(1000.0, timestamp_ms))
                .await
                .unwrap();
        }
        assert!((temporary(&h.store, "sensor_oven") - 1.0).abs() < 1e-12);

        h.registry.upsert(descriptor("sensor.oven", "W", Some(20.0)));
        assert!(h
            .dispatcher
            .handle(Event::Enable {
                entity_id: "sensor.oven".into()
            })
            .await);

        let entity = h.dispatcher.entity("sensor.oven").unwrap();
        assert_eq!(entity.settings.start_threshold, Some(20.0));
        assert_eq!(entity.memory.previous_reading_ts, Some(HOUR_MS));
        assert!(h.store.is_subscribed("sensor.oven"));

        h.dispatcher
            .on_sample("sensor.oven", &RawSample::new(1000.0, 3 * HOUR_MS))
            .await
            .unwrap();
        assert!((temporary(&h.store, "sensor_oven") - 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_accumulator_for_next_reset() {
        let mut h = harness(vec![descriptor("sensor.pv", "W", Some(5.0))], true);
        h.dispatcher.initialize("sensor.pv").await.unwrap();
        for timestamp_ms in [0, HOUR_MS] {
            h.dispatcher
                .on_sample("sensor.pv", &RawSample::new(100.0, timestamp_ms))
                .await
                .unwrap();
        }

        h.store.reject_writes_to(Some(SlotKind::Cumulative));
        let err = h
            .dispatcher
            .on_sample("sensor.pv", &RawSample::new(-0.5, 2 * HOUR_MS))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StoreWriteFailure {
                slot: SlotKind::Cumulative,
                ..
            }
        ));
        // Only the temporary slot went through; the persisted total is untouched
        assert_eq!(temporary(&h.store, "sensor_pv"), 0.0);
        assert_eq!(h.store.slot("sensor_pv", SlotKind::Cumulative), None);
        assert_eq!(h.store.slot("sensor_pv", SlotKind::ResetMode), None);
        let memory = &h.dispatcher.entity("sensor.pv").unwrap().memory;
        assert!((memory.cumulative_value - 0.1).abs() < 1e-12);

        h.store.reject_writes_to(None);
        let result = h
            .dispatcher
            .on_sample("sensor.pv", &RawSample::new(-0.5, 3 * HOUR_MS))
            .await
            .unwrap();
        assert!(matches!(result, Dispatch::Applied(CycleKind::Reset { .. })));
        let flushed = h
            .store
            .slot("sensor_pv", SlotKind::Cumulative)
            .and_then(SlotValue::as_number)
            .unwrap();
        assert!((flushed - 0.1).abs() < 1e-12);
        assert_eq!(
            h.store.slot("sensor_pv", SlotKind::ResetMode),
            Some(SlotValue::Flag(true))
        );
    }

    #[tokio::test]
    async fn test_run_ends_on_shutdown_only() {
        let h = harness(vec![descriptor("sensor.a", "W", None)], true);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(h.dispatcher.run(rx));

        tx.send(Event::Disable {
            entity_id: "sensor.a".into(),
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        tx.send(Event::Shutdown).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(500), task)
            .await
            .expect("dispatcher loop should stop")
            .unwrap();
    }
}
