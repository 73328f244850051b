//! Wall-clock driver: advances the simulation on a tokio interval until told to stop.

use std::sync::Arc;

use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::info;

use crate::simulation::Simulation;

pub struct SimulationDriver {
    simulation: Arc<RwLock<Simulation>>,
    shutdown_sender: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<u64>>>,
}

impl SimulationDriver {
    pub fn new(simulation: Simulation) -> Self {
        Self {
            simulation: Arc::new(RwLock::new(simulation)),
            shutdown_sender: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Shared handle for readers (snapshots) and admin mutations.
    pub fn simulation(&self) -> Arc<RwLock<Simulation>> {
        Arc::clone(&self.simulation)
    }

    /// Advances `ticks` steps immediately, without waiting on the wall clock.
    pub async fn run_ticks(&self, ticks: usize) -> u64 {
        let mut sim = self.simulation.write().await;
        sim.run_ticks(ticks);
        sim.now()
    }

    /// Spawns the periodic loop. `max_ticks` bounds the run; `None` runs until `stop`.
    /// Returns false if a loop is already running.
    pub async fn start(&self, max_ticks: Option<u64>) -> bool {
        let mut handle_slot = self.handle.lock().await;
        if handle_slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return false;
        }

        let (tx, mut rx) = oneshot::channel();
        *self.shutdown_sender.lock().await = Some(tx);

        let simulation = Arc::clone(&self.simulation);
        let period = simulation.read().await.tick_interval();

        *handle_slot = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u64;
            info!("▶️ Driver started ({:?} per tick)", period);
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        simulation.write().await.step();
                        ticks += 1;
                        if max_ticks.map(|max| ticks >= max).unwrap_or(false) {
                            break;
                        }
                    }
                }
            }
            info!("⏹️ Driver stopped after {} ticks", ticks);
            ticks
        }));
        true
    }

    /// Signals the loop to stop and waits for it. Returns the ticks it ran.
    pub async fn stop(&self) -> u64 {
        if let Some(tx) = self.shutdown_sender.lock().await.take() {
            tx.send(()).ok();
        }
        self.join().await
    }

    /// Waits for the loop to end on its own.
    pub async fn join(&self) -> u64 {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(h) => h.await.unwrap_or(0),
            None => 0,
        }
    }
}
