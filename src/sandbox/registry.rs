//! One sandbox per session: the registry boots the engine at most once and
//! hands the same [`SandboxHandle`] to every caller until it is torn down.
//!
//! The slot is either empty, booting (holding a shared pending boot that every
//! concurrent caller awaits) or ready. A failed boot empties the slot so the
//! next `acquire` retries. Tearing down while a boot is in flight abandons
//! that boot; its engine is torn down once, by the first waiter to see it.

use super::{SandboxBooter, SandboxHandle};
use crate::error::SandboxError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type PendingBoot = Shared<BoxFuture<'static, Result<SandboxHandle, Arc<anyhow::Error>>>>;

enum Slot {
    Empty,
    Booting {
        generation: u64,
        pending: PendingBoot,
        /// Set by the waiter that tears down an abandoned result.
        reaped: Arc<AtomicBool>,
    },
    Ready(SandboxHandle),
}

struct RegistryState {
    slot: Slot,
    generation: u64,
}

pub struct SandboxRegistry {
    booter: Arc<dyn SandboxBooter>,
    state: Mutex<RegistryState>,
}

impl SandboxRegistry {
    pub fn new(booter: Arc<dyn SandboxBooter>) -> Self {
        Self {
            booter,
            state: Mutex::new(RegistryState {
                slot: Slot::Empty,
                generation: 0,
            }),
        }
    }

    /// Return the live sandbox, booting one if needed. Concurrent callers
    /// during a boot all wait on that same boot.
    pub async fn acquire(&self) -> Result<SandboxHandle, SandboxError> {
        let (generation, pending, reaped) = {
            let mut state = self.state.lock();
            let in_flight = match &state.slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::Booting {
                    generation,
                    pending,
                    reaped,
                } => Some((*generation, pending.clone(), reaped.clone())),
                Slot::Empty => None,
            };
            match in_flight {
                Some(in_flight) => in_flight,
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let booter = self.booter.clone();
                    let pending = async move {
                        tracing::info!("Booting sandbox engine (generation {generation})");
                        booter
                            .boot()
                            .await
                            .map(SandboxHandle::new)
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    let reaped = Arc::new(AtomicBool::new(false));
                    state.slot = Slot::Booting {
                        generation,
                        pending: pending.clone(),
                        reaped: reaped.clone(),
                    };
                    (generation, pending, reaped)
                }
            }
        };

        let outcome = pending.await;

        let orphan = {
            let mut state = self.state.lock();
            let is_current = matches!(
                &state.slot,
                Slot::Booting { generation: g, .. } if *g == generation
            );
            match outcome {
                Ok(handle) if is_current => {
                    tracing::info!("Sandbox {} ready", handle.id());
                    state.slot = Slot::Ready(handle.clone());
                    return Ok(handle);
                }
                Ok(handle) => match &state.slot {
                    // Another waiter of the same boot already stored it.
                    Slot::Ready(existing) if existing.same_as(&handle) => return Ok(handle),
                    _ => handle,
                },
                Err(err) => {
                    if is_current {
                        state.slot = Slot::Empty;
                    }
                    return Err(SandboxError::Boot(format!("{err:#}")));
                }
            }
        };

        if reaped.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        tracing::info!("Discarding sandbox {} booted after teardown", orphan.id());
        if let Err(e) = orphan.engine().teardown().await {
            tracing::warn!("Failed to tear down orphaned sandbox: {e:#}");
        }
        Err(SandboxError::TornDown)
    }

    /// The live sandbox, if one has finished booting.
    pub fn current(&self) -> Option<SandboxHandle> {
        match &self.state.lock().slot {
            Slot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_booting(&self) -> bool {
        matches!(self.state.lock().slot, Slot::Booting { .. })
    }

    /// Destroy the live sandbox. The next `acquire` performs a fresh boot.
    pub async fn teardown(&self) {
        let previous = std::mem::replace(&mut self.state.lock().slot, Slot::Empty);
        match previous {
            Slot::Ready(handle) => {
                tracing::info!("Tearing down sandbox {}", handle.id());
                if let Err(e) = handle.engine().teardown().await {
                    tracing::warn!("Sandbox teardown reported an error: {e:#}");
                }
            }
            Slot::Booting { generation, .. } => {
                tracing::debug!("Abandoning in-flight sandbox boot (generation {generation})");
            }
            Slot::Empty => {}
        }
    }
}
