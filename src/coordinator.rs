use std::sync::Arc;

use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::readiness::{readiness, Readiness};
use crate::store::{Event, Registry, StateStore};
use crate::units::UnitTable;

const EVENT_CAPACITY: usize = 128;

/// Outcome of the startup initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupSummary {
    pub enabled: usize,
    pub initialised: usize,
    pub failed: usize,
}

/// Brings the engine up: initialises every enabled entity, starts the
/// dispatcher loop and opens the readiness barrier once things settled.
pub struct Coordinator;

impl Coordinator {
    pub async fn start<S: StateStore, R: Registry>(
        config: &EngineConfig,
        store: Arc<S>,
        registry: Arc<R>,
    ) -> anyhow::Result<CoordinatorHandle> {
        info!("delta consumption preparing to work ...");
        let units = UnitTable::global();
        debug!(units = ?units.symbols(), "unit definitions loaded");

        let (gate, readiness) = readiness();
        let (events, receiver) = mpsc::channel(EVENT_CAPACITY);
        let mut dispatcher = Dispatcher::new(
            store,
            registry.clone(),
            readiness.clone(),
            events.clone(),
            config.restore_totals,
        );

        let entity_ids = registry.enabled_entities().await?;
        let enabled = entity_ids.len();
        info!("found {enabled} enabled entities");

        let mut initialised = 0;
        let mut failed = 0;
        for (index, entity_id) in entity_ids.iter().enumerate() {
            let count = index + 1;
            info!("initialising ({count}/{enabled}) {entity_id}");
            match dispatcher.initialize(entity_id).await {
                Ok(()) => {
                    initialised += 1;
                    info!("initialisation ({count}/{enabled}) of {entity_id} successful");
                }
                Err(e) => {
                    failed += 1;
                    error!(entity = %entity_id, "initialisation failed: {e}");
                }
            }
        }

        let task = tokio::spawn(dispatcher.run(receiver));
        gate.open_after(config.settle_delay);

        if failed > 0 {
            warn!("cannot handle calculations for {failed} of {enabled} enabled entities, check error messages");
        }
        info!("delta consumption active for {initialised} of {enabled} entities");

        Ok(CoordinatorHandle {
            events,
            readiness,
            task,
            summary: StartupSummary {
                enabled,
                initialised,
                failed,
            },
        })
    }
}

/// Control surface of a running engine.
pub struct CoordinatorHandle {
    events: Sender<Event>,
    readiness: Readiness,
    task: JoinHandle<()>,
    summary: StartupSummary,
}

impl CoordinatorHandle {
    pub fn summary(&self) -> StartupSummary {
        self.summary
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// (Re-)initialises an entity whose configuration was enabled or changed.
    pub async fn enable(&self, entity_id: &str) -> anyhow::Result<()> {
        self.send(Event::Enable {
            entity_id: entity_id.to_string(),
        })
        .await
    }

    pub async fn disable(&self, entity_id: &str) -> anyhow::Result<()> {
        self.send(Event::Disable {
            entity_id: entity_id.to_string(),
        })
        .await
    }

    async fn send(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher is not running"))
    }

    /// Unsubscribes all entities and waits for the dispatcher loop to end.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.send(Event::Shutdown).await?;
        self.task.await?;
        Ok(())
    }
}
