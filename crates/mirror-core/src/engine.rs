//! Engine facade.
//!
//! Wires the registry, scanner, scheduler, swap manager, and event
//! bus together behind one handle the host embeds. The host calls
//! `startup` once, `tick` every game tick with the target region
//! writer, `handle_command` for user operations, and the connect and
//! disconnect hooks as players come and go.

use crate::command::{EngineCommand, EngineEvent, EventBus, EventSink};
use crate::config::EngineConfig;
use crate::policy::ContentPolicy;
use crate::profile::{PlayerHandle, ProfileSwapManager, SwapError};
use crate::scanner::{RegionScanner, ScanError, ScanRequest, ScanSink};
use crate::scheduler::{ReplicationScheduler, TickReport};
use crate::session::{RegistryState, SessionKey, SessionRegistry};
use crate::snapshot::{SnapshotStore, StoreError};
use crate::world::{WorldView, WorldWriter};
use mirror_common::{MirrorResult, RegionId, UserId};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Store key the aggregated registry state persists under.
const AGGREGATE_KEY: &str = "sessions";

/// The replication and profile-migration engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    store: Arc<SnapshotStore>,
    scanner: RegionScanner,
    scheduler: ReplicationScheduler,
    swap: ProfileSwapManager,
    events: Arc<EventBus>,
}

impl Engine {
    /// Builds an engine from config. The scan worker starts
    /// immediately; call [`Engine::startup`] before serving traffic.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(SnapshotStore::new(&config.data_dir));
        let policy = Arc::new(ContentPolicy::from_config(&config));
        let events = Arc::new(EventBus::new());
        let sink: Arc<dyn ScanSink> = Arc::new(EventSink(Arc::clone(&events)));
        let target_region = RegionId::new(&config.target_region);

        let scanner = RegionScanner::new(
            Arc::clone(&registry),
            Arc::clone(&policy),
            Arc::clone(&sink),
            config.min_scan_radius,
            config.max_scan_radius,
            target_region.clone(),
        );
        let scheduler = ReplicationScheduler::new(
            Arc::clone(&registry),
            policy,
            sink,
            Arc::clone(scanner.ready_sessions()),
            config.blocks_per_tick,
            config.complex_per_tick,
        );
        let swap = ProfileSwapManager::new(
            Arc::clone(&store),
            Arc::clone(&registry) as Arc<dyn crate::profile::LocationState>,
            target_region,
        );

        Self {
            config,
            registry,
            store,
            scanner,
            scheduler,
            swap,
            events,
        }
    }

    /// Loads persisted session state. In-memory state is dropped
    /// first so a restart always reflects exactly what was flushed.
    pub fn startup(&self) -> MirrorResult<()> {
        self.registry.clear_all();
        match self.store.load::<RegistryState>(AGGREGATE_KEY) {
            Ok(state) => {
                self.registry.import_state(state);
                Ok(())
            },
            Err(StoreError::NotFound(_)) => {
                info!("No persisted session state, starting fresh");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Flushes session state and stops accepting work.
    pub fn shutdown(&self) -> MirrorResult<()> {
        self.flush()
    }

    /// Advances replication by one tick. Flush failures after
    /// finalization are logged, not propagated; placement already
    /// happened and the next flush retries.
    pub fn tick(&self, target: &mut dyn WorldWriter) -> TickReport {
        let report = self.scheduler.tick(target);
        if !report.finalized.is_empty() {
            if let Err(e) = self.flush() {
                error!("Failed to flush session state after finalization: {e}");
            }
        }
        report
    }

    /// Handles a user command. Validation failures surface as
    /// [`EngineEvent::Rejected`] on the bus; only infrastructure
    /// failures return an error.
    pub fn handle_command(
        &self,
        player: &mut dyn PlayerHandle,
        source: Arc<dyn WorldView>,
        command: EngineCommand,
    ) -> MirrorResult<()> {
        let user = player.user_id();
        match command {
            EngineCommand::RequestScan { origin, radius } => {
                let request = ScanRequest {
                    user,
                    caller_region: player.current_region(),
                    origin,
                    radius: self.config.clamp_radius(radius),
                };
                match self.scanner.start_scan(&request, source) {
                    Ok(key) => {
                        info!("Started session {key}");
                        Ok(())
                    },
                    Err(e @ (ScanError::WrongRegion | ScanError::InvalidRadius { .. })) => {
                        self.reject(user, &e.to_string());
                        Ok(())
                    },
                    Err(e) => Err(e.into()),
                }
            },
            EngineCommand::RequestStatus { origin } => {
                let key = SessionKey::new(user, player.current_region(), origin);
                let status = self.registry.status(&key);
                self.events.publish(EngineEvent::SnapshotStatus {
                    user,
                    has_snapshot: status.is_some(),
                    unit_count: status.map_or(0, |s| s.total_units),
                    complete: status.is_some_and(|s| s.complete),
                    progress_percent: status.map_or(0, |s| s.progress_percent()),
                });
                Ok(())
            },
            EngineCommand::RequestTransition { origin } => {
                let key = SessionKey::new(user, player.current_region(), origin);
                self.transition(player, &key)
            },
        }
    }

    fn transition(&self, player: &mut dyn PlayerHandle, key: &SessionKey) -> MirrorResult<()> {
        let user = key.user;
        let Some(status) = self.registry.status(key) else {
            self.reject(user, "no replication session at that origin");
            return Ok(());
        };
        if !status.complete || self.scheduler.has_session(user) {
            self.reject(user, "replication still in progress");
            return Ok(());
        }

        self.registry.set_active(key.clone());
        match self.swap.enter_target(player) {
            Ok(()) => {},
            Err(SwapError::Inconsistent(reason)) => {
                self.reject(user, &reason);
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        }

        self.flush()?;
        self.events.publish(EngineEvent::TransitionCompleted {
            user,
            in_target: true,
        });
        Ok(())
    }

    /// Moves a player back out of the target region into their
    /// source-slot profile.
    pub fn return_to_source(&self, player: &mut dyn PlayerHandle) -> MirrorResult<()> {
        let user = player.user_id();
        match self.swap.return_to_source(player) {
            Ok(()) => {},
            Err(SwapError::Inconsistent(reason)) => {
                self.reject(user, &reason);
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        }
        self.flush()?;
        self.events.publish(EngineEvent::TransitionCompleted {
            user,
            in_target: false,
        });
        Ok(())
    }

    /// Restores a reconnecting player to the slot their persisted
    /// location names.
    pub fn on_user_connect(&self, player: &mut dyn PlayerHandle) -> MirrorResult<()> {
        self.swap.on_reconnect(player)?;
        self.flush()
    }

    /// Saves a disconnecting player into the slot matching their
    /// location.
    pub fn on_user_disconnect(&self, player: &dyn PlayerHandle) -> MirrorResult<()> {
        self.swap.on_disconnect(player)?;
        self.flush()
    }

    fn flush(&self) -> MirrorResult<()> {
        self.store
            .save(AGGREGATE_KEY, &self.registry.export_state())?;
        Ok(())
    }

    fn reject(&self, user: UserId, reason: &str) {
        warn!("Rejected command from {user}: {reason}");
        self.events.publish(EngineEvent::Rejected {
            user,
            reason: reason.to_string(),
        });
    }

    /// Shared session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Outbound event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
