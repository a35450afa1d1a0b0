//! Circuit Manager
//!
//! Builds circuits over randomly chosen trusted relays, retries around
//! relays that fail to extend, and keeps the set of live circuits under a
//! fixed capacity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veilroute_network::CircuitId;

use crate::circuit::{Circuit, CircuitContext};
use crate::config::RouterConfig;
use crate::error::{CoreError, CoreResult};

/// A circuit shared between the manager and its user
pub type SharedCircuit = Arc<tokio::sync::Mutex<Circuit>>;

struct ManagedCircuit {
    circuit: SharedCircuit,
    /// Returned to the pool when the circuit leaves the active set
    _permit: OwnedSemaphorePermit,
}

struct Sweeper {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Owns every circuit built by this router
pub struct CircuitManager {
    ctx: CircuitContext,
    config: RouterConfig,
    permits: Arc<Semaphore>,
    circuits: Mutex<HashMap<CircuitId, ManagedCircuit>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CircuitManager {
    pub fn new(ctx: CircuitContext, config: RouterConfig) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(config.max_circuits)),
            config,
            circuits: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Build and register a circuit of `hop_count` distinct trusted relays
    pub async fn create_circuit(&self, hop_count: usize) -> CoreResult<SharedCircuit> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoreError::CapacityError {
                max: self.config.max_circuits,
            })?;

        if hop_count == 0 || hop_count > self.ctx.max_hops {
            return Err(CoreError::InvalidHopCount {
                requested: hop_count,
                max: self.ctx.max_hops,
            });
        }

        let circuit = self.build(hop_count).await?;
        let id = circuit.id();
        let shared = Arc::new(tokio::sync::Mutex::new(circuit));
        self.circuits.lock().insert(
            id,
            ManagedCircuit {
                circuit: shared.clone(),
                _permit: permit,
            },
        );

        debug!("Active circuits: {}", self.active_count());
        Ok(shared)
    }

    async fn build(&self, hop_count: usize) -> CoreResult<Circuit> {
        let directory = &self.ctx.directory;
        let mut path: Vec<String> = Vec::with_capacity(hop_count);
        let mut excluded: HashSet<String> = HashSet::new();
        let mut failures = vec![0usize; hop_count];
        let mut circuit = Circuit::new(self.ctx.clone());

        while circuit.hop_count() < hop_count {
            let position = circuit.hop_count();
            let node_id = match path.get(position) {
                Some(node_id) => node_id.clone(),
                None => {
                    let picked = directory.select_random(|n| {
                        n.trusted && !excluded.contains(&n.node_id) && !path.contains(&n.node_id)
                    });
                    let Some(node) = picked else {
                        warn!(
                            "No usable relay for hop {} of {} ({} excluded)",
                            position + 1,
                            hop_count,
                            excluded.len()
                        );
                        circuit.close();
                        return Err(CoreError::NoPathAvailable);
                    };
                    path.push(node.node_id.clone());
                    node.node_id
                }
            };

            match circuit.extend(&node_id).await {
                Ok(()) => {}
                Err(CoreError::ExtendError(reason)) => {
                    failures[position] += 1;
                    if failures[position] > self.config.extend_retries {
                        warn!(
                            "Giving up on hop {} after {} failures",
                            position + 1,
                            failures[position]
                        );
                        return Err(CoreError::ExtendError(reason));
                    }

                    warn!(
                        "Extend to {} at hop {} failed: {}, retrying",
                        node_id,
                        position + 1,
                        reason
                    );
                    excluded.insert(node_id);
                    path.truncate(position);
                    // The failed circuit is dead; rebuild over the good prefix
                    circuit = Circuit::new(self.ctx.clone());
                }
                Err(e) => return Err(e),
            }
        }

        circuit.finalize()?;
        Ok(circuit)
    }

    /// Close a circuit and free its slot. A user parked in
    /// `receive_data` is woken first so the circuit's lock comes free.
    pub async fn destroy_circuit(&self, id: CircuitId) -> CoreResult<()> {
        let managed = self
            .circuits
            .lock()
            .remove(&id)
            .ok_or(CoreError::CircuitNotFound(id))?;

        self.ctx.dispatcher.close(id);
        managed.circuit.lock().await.close();
        debug!("Active circuits: {}", self.active_count());
        Ok(())
    }

    /// Close idle circuits and drop terminal ones. Circuits that are
    /// currently in use are left alone. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let candidates: Vec<(CircuitId, SharedCircuit)> = self
            .circuits
            .lock()
            .iter()
            .map(|(id, m)| (*id, m.circuit.clone()))
            .collect();

        let mut swept = Vec::new();
        for (id, circuit) in candidates {
            let Ok(mut circuit) = circuit.try_lock() else {
                continue;
            };
            if circuit.state().is_terminal() || circuit.idle_time() > self.config.idle_timeout {
                circuit.close();
                swept.push(id);
            }
        }

        if !swept.is_empty() {
            let mut circuits = self.circuits.lock();
            for id in &swept {
                circuits.remove(id);
            }
            info!("Swept {} idle circuits", swept.len());
        }
        swept.len()
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until
    /// [`shutdown`](Self::shutdown)
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let stop = Arc::new(Notify::new());
        let manager = Arc::clone(self);
        let stopped = stop.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sweep_idle();
                    }
                    _ = stopped.notified() => {
                        debug!("Circuit sweeper stopping");
                        break;
                    }
                }
            }
        });

        *slot = Some(Sweeper { stop, task });
    }

    /// Stop the sweeper and close every circuit
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop.notify_one();
            let _ = sweeper.task.await;
        }

        let drained: Vec<(CircuitId, ManagedCircuit)> = self.circuits.lock().drain().collect();
        let count = drained.len();
        for (id, _) in &drained {
            self.ctx.dispatcher.close(*id);
        }
        for (_, managed) in drained {
            managed.circuit.lock().await.close();
        }

        if count > 0 {
            info!("Closed {} circuits on shutdown", count);
        }
    }

    pub fn active_count(&self) -> usize {
        self.circuits.lock().len()
    }

    /// Circuit slots still free
    pub fn available_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn circuit(&self, id: CircuitId) -> Option<SharedCircuit> {
        self.circuits.lock().get(&id).map(|m| m.circuit.clone())
    }

    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.lock().keys().copied().collect()
    }
}
