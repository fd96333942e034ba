//! Per-lobby game engine
//!
//! Owns the lobby's logic services and the tick loop that drives them:
//!
//! ```text
//! interactions_update(delta) -> service.update(delta)... -> events_update(delta) -> sleep
//! ```
//!
//! Pause and shutdown are cooperative. The loop checks its status once it holds
//! the tick guard, so an iteration in flight always completes and none starts
//! after shutdown has taken the guard. At most one loop runs per engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::game::service::{LogicService, ServiceContext, ServiceFactory};
use crate::game::status::{EngineStatus, StatusCell, StatusObserver};
use crate::game::tick::{next_delta, sleep_budget, TickHealth, TickMonitor};
use crate::lobby::GameConfiguration;
use crate::metrics::Metrics;
use crate::net::NetworkEngine;

/// Services and the network engine of one run, fixed between start and shutdown
#[derive(Clone)]
struct Runtime {
    network: Arc<NetworkEngine>,
    services: Arc<[Arc<dyn LogicService>]>,
}

pub struct GameEngine {
    lobby_id: Uuid,
    config: EngineConfig,
    metrics: Arc<Metrics>,
    status: StatusCell,
    runtime: Mutex<Option<Runtime>>,
    /// Held for the whole of each iteration and of the shutdown flush
    tick_guard: ReentrantMutex<()>,
    /// Set while a tick loop task is alive
    loop_active: AtomicBool,
    monitor: Mutex<TickMonitor>,
}

impl GameEngine {
    pub fn new(lobby_id: Uuid, config: EngineConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let monitor = TickMonitor::new(config.target_tick_duration());
        Arc::new(Self {
            lobby_id,
            config,
            metrics,
            status: StatusCell::new(),
            runtime: Mutex::new(None),
            tick_guard: ReentrantMutex::new(()),
            loop_active: AtomicBool::new(false),
            monitor: Mutex::new(monitor),
        })
    }

    pub fn lobby_id(&self) -> Uuid {
        self.lobby_id
    }

    pub fn status(&self) -> EngineStatus {
        self.status.get()
    }

    /// Observe every status transition
    pub fn subscribe(&self, observer: StatusObserver) {
        self.status.subscribe(observer);
    }

    /// Build services, bind them, run init then start on each, then launch the loop
    pub fn start(
        self: &Arc<Self>,
        network: Arc<NetworkEngine>,
        configuration: GameConfiguration,
        factory: &ServiceFactory,
    ) -> Result<(), EngineError> {
        let from = self.status();
        if !matches!(from, EngineStatus::Created | EngineStatus::Stopped) {
            return Err(EngineError::InvalidTransition { from, action: "start" });
        }
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        self.status.set(EngineStatus::Loading);

        let context = ServiceContext {
            lobby_id: self.lobby_id,
            network: Arc::clone(&network),
            config: configuration,
        };
        let services: Arc<[Arc<dyn LogicService>]> = factory(&context).into();
        network.start(&services[..]);

        // Two full passes, never interleaved
        for service in services.iter() {
            if let Err(e) = service.init() {
                return Err(self.abort_start(&network, &services, service.owner(), "init", e));
            }
        }
        for service in services.iter() {
            if let Err(e) = service.start() {
                return Err(self.abort_start(&network, &services, service.owner(), "start", e));
            }
        }

        let service_count = services.len();
        *self.runtime.lock() = Some(Runtime { network, services });

        self.status.set(EngineStatus::Running);
        Metrics::incr(&self.metrics.game_engines_running);
        self.launch_loop(&handle);

        info!(
            lobby = %self.lobby_id,
            services = service_count,
            "Game engine started at {} Hz", self.config.target_tick_rate
        );
        Ok(())
    }

    fn abort_start(
        &self,
        network: &NetworkEngine,
        services: &[Arc<dyn LogicService>],
        owner: &str,
        phase: &'static str,
        cause: anyhow::Error,
    ) -> EngineError {
        error!(lobby = %self.lobby_id, service = %owner, "Service failed to {}: {:#}", phase, cause);
        network.exit(services);
        self.status.set(EngineStatus::Stopped);
        EngineError::ServiceFailed {
            service: owner.to_string(),
            phase,
            reason: format!("{:#}", cause),
        }
    }

    /// Stop ticking after the in-flight iteration. Pausing a paused engine is a no-op.
    ///
    /// Events queued up to this point, the status change and whatever the
    /// pause hooks sent included, are delivered before returning.
    pub fn pause(&self) -> Result<(), EngineError> {
        match self.status() {
            EngineStatus::Running => {}
            EngineStatus::Paused => return Ok(()),
            from => return Err(EngineError::InvalidTransition { from, action: "pause" }),
        }

        self.status.set(EngineStatus::Paused);
        self.for_each_service("pause", |service| service.pause());

        let _tick = self.tick_guard.lock();
        let network = self.runtime.lock().as_ref().map(|runtime| Arc::clone(&runtime.network));
        if let Some(network) = network {
            network.events_update(Duration::ZERO);
        }

        info!(lobby = %self.lobby_id, "Game engine paused");
        Ok(())
    }

    /// Resume a paused engine. Unpausing a running engine is a no-op.
    pub fn unpause(self: &Arc<Self>) -> Result<(), EngineError> {
        match self.status() {
            EngineStatus::Paused => {}
            EngineStatus::Running => return Ok(()),
            from => return Err(EngineError::InvalidTransition { from, action: "unpause" }),
        }
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        self.status.set(EngineStatus::Loading);
        self.for_each_service("unpause", |service| service.unpause());
        self.status.set(EngineStatus::Running);
        self.launch_loop(&handle);

        info!(lobby = %self.lobby_id, "Game engine resumed");
        Ok(())
    }

    /// Flush pending interactions into the services, exit them, flush their
    /// last events, then unbind them. A stopped or never-started engine is left as is.
    pub fn shutdown(&self) {
        if !self.status().is_active() {
            return;
        }
        if self.status() == EngineStatus::Running {
            self.status.set(EngineStatus::Paused);
            self.for_each_service("pause", |service| service.pause());
        }

        // Waits out an in-flight iteration on another thread
        let _tick = self.tick_guard.lock();
        let Some(runtime) = self.runtime.lock().take() else {
            self.status.set(EngineStatus::Stopped);
            return;
        };

        runtime.network.interactions_update(Duration::ZERO);
        self.status.set(EngineStatus::Stopped);
        Self::run_hook(self.lobby_id, &runtime.services, "exit", |service| service.exit());
        runtime.network.events_update(Duration::ZERO);
        runtime.network.exit(&runtime.services[..]);

        Metrics::decr(&self.metrics.game_engines_running);
        info!(lobby = %self.lobby_id, "Game engine stopped");
    }

    fn for_each_service(&self, hook: &'static str, f: impl Fn(&dyn LogicService) -> anyhow::Result<()>) {
        let services = self.runtime.lock().as_ref().map(|runtime| Arc::clone(&runtime.services));
        if let Some(services) = services {
            Self::run_hook(self.lobby_id, &services, hook, f);
        }
    }

    /// Run a lifecycle hook on every service; a failure is logged and the rest still run
    fn run_hook(
        lobby_id: Uuid,
        services: &[Arc<dyn LogicService>],
        hook: &'static str,
        f: impl Fn(&dyn LogicService) -> anyhow::Result<()>,
    ) {
        for service in services {
            if let Err(e) = f(service.as_ref()) {
                warn!(lobby = %lobby_id, service = %service.owner(), "Service {} failed: {:#}", hook, e);
            }
        }
    }

    /// Spawn the tick loop unless one is still alive. A loop that is winding
    /// down after a pause picks the run back up instead.
    fn launch_loop(self: &Arc<Self>, handle: &Handle) {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(lobby = %self.lobby_id, "Tick loop still alive, not spawning another");
            return;
        }
        handle.spawn(run_loop(Arc::downgrade(self), self.lobby_id, self.config.target_tick_duration()));
    }

    /// One iteration. Returns the time spent working, or `None` once the
    /// engine is no longer running.
    fn tick(&self, delta: Duration) -> Option<Duration> {
        let _tick = self.tick_guard.lock();
        if !self.should_tick() {
            return None;
        }
        let runtime = self.runtime.lock().clone()?;
        let started = Instant::now();

        runtime.network.interactions_update(delta);
        for service in runtime.services.iter() {
            if let Err(e) = service.update(delta) {
                warn!(lobby = %self.lobby_id, service = %service.owner(), "Service update failed: {:#}", e);
            }
        }
        runtime.network.events_update(delta);

        let work = started.elapsed();
        self.metrics.record_tick_time(work);
        let mut monitor = self.monitor.lock();
        if let Some(health) = monitor.record(work) {
            match health {
                TickHealth::Overloaded => warn!(
                    lobby = %self.lobby_id,
                    p95 = ?monitor.p95(),
                    "Tick work exceeds the target tick, deltas stretching"
                ),
                other => debug!(lobby = %self.lobby_id, "Tick health now {:?}", other),
            }
        }
        Some(work)
    }

    fn should_tick(&self) -> bool {
        self.status() == EngineStatus::Running
    }

    /// Called by a loop that found the engine not running. Returns true if
    /// the loop should carry on because a launch skipped its spawn meanwhile.
    fn retire_loop(&self) -> bool {
        self.loop_active.store(false, Ordering::SeqCst);
        self.should_tick()
            && self.runtime.lock().is_some()
            && self
                .loop_active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

async fn run_loop(engine: Weak<GameEngine>, lobby_id: Uuid, target: Duration) {
    let mut previous_work = Duration::ZERO;

    loop {
        let work = {
            let Some(engine) = engine.upgrade() else { break };
            match engine.tick(next_delta(target, previous_work)) {
                Some(work) => work,
                None if engine.retire_loop() => continue,
                None => break,
            }
        };

        tokio::time::sleep(sleep_budget(target, work)).await;
        previous_work = work;
    }

    debug!(lobby = %lobby_id, "Tick loop exited");
}

impl fmt::Debug for GameEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameEngine")
            .field("lobby_id", &self.lobby_id)
            .field("status", &self.status())
            .field("tick_health", &self.monitor.lock().health())
            .finish()
    }
}

/// Game engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("service '{service}' failed to {phase}: {reason}")]
    ServiceFailed {
        service: String,
        phase: &'static str,
        reason: String,
    },
    #[error("cannot {action} an engine that is {from:?}")]
    InvalidTransition {
        from: EngineStatus,
        action: &'static str,
    },
    #[error("no async runtime available for the tick loop")]
    NoRuntime,
}
