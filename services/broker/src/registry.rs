//! Instance Registry
//!
//! Volatile map of service instances behind a single reader/writer lock.
//! Each entry is a slot with a lifecycle state, so callers only hold the lock
//! for the check-and-transition itself and never across provisioner calls.
//!
//! Every reservation gets a fresh generation number. Writes that were
//! decided on an earlier snapshot carry its generation and are refused once
//! the id has been removed and reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::types::{Credential, ServiceInstance};

#[derive(Debug)]
struct Tracked {
    generation: u64,
    instance: ServiceInstance,
}

#[derive(Debug)]
enum Slot {
    /// Reserved by an in-flight create; invisible to readers
    Provisioning,
    Ready(Tracked),
    /// Teardown in flight; still visible to readers
    Deprovisioning(Tracked),
}

type Slots = Arc<RwLock<HashMap<String, Slot>>>;

fn release_slot(slots: &mut HashMap<String, Slot>, id: &str) {
    if matches!(slots.get(id), Some(Slot::Provisioning)) {
        slots.remove(id);
        debug!(instance_id = %id, "Released instance reservation");
    }
}

/// A ready instance together with the generation it was read at
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub instance: ServiceInstance,
}

/// Claim on an instance id held by an in-flight create.
///
/// Dropping it without [`Reservation::commit`] frees the id again.
#[derive(Debug)]
pub struct Reservation {
    slots: Slots,
    id: String,
    generation: u64,
    settled: bool,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the fully provisioned instance under the reserved id
    pub async fn commit(mut self, instance: ServiceInstance) {
        let mut slots = self.slots.write().await;
        slots.insert(
            self.id.clone(),
            Slot::Ready(Tracked {
                generation: self.generation,
                instance,
            }),
        );
        self.settled = true;
    }

    /// Give the id back after a failed create
    pub async fn release(mut self) {
        let mut slots = self.slots.write().await;
        release_slot(&mut slots, &self.id);
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        warn!(instance_id = %self.id, "Create abandoned before commit, releasing reservation");
        if let Ok(mut slots) = self.slots.try_write() {
            release_slot(&mut slots, &self.id);
            return;
        }

        let slots = self.slots.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_slot(&mut *slots.write().await, &id);
                });
            }
            Err(_) => warn!(instance_id = %id, "No runtime to release reservation, id stays taken"),
        }
    }
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    slots: Slots,
    next_generation: AtomicU64,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a create. Fails if the id is taken in any state.
    pub async fn reserve(&self, id: &str) -> Result<Reservation> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(id) {
            return Err(BrokerError::AlreadyExists(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Provisioning);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(instance_id = %id, generation, "Reserved instance id");

        Ok(Reservation {
            slots: self.slots.clone(),
            id: id.to_string(),
            generation,
            settled: false,
        })
    }

    /// Read an instance. In-flight creates are reported as absent.
    pub async fn get(&self, id: &str) -> Result<ServiceInstance> {
        let slots = self.slots.read().await;
        match slots.get(id) {
            Some(Slot::Ready(tracked)) | Some(Slot::Deprovisioning(tracked)) => {
                Ok(tracked.instance.clone())
            }
            Some(Slot::Provisioning) | None => Err(BrokerError::NotFound(id.to_string())),
        }
    }

    /// Read an instance that is available for bind
    pub async fn snapshot_ready(&self, id: &str) -> Result<Snapshot> {
        let slots = self.slots.read().await;
        match slots.get(id) {
            Some(Slot::Ready(tracked)) => Ok(Snapshot {
                generation: tracked.generation,
                instance: tracked.instance.clone(),
            }),
            Some(Slot::Deprovisioning(_)) => Err(BrokerError::OperationInProgress(id.to_string())),
            Some(Slot::Provisioning) | None => Err(BrokerError::NotFound(id.to_string())),
        }
    }

    /// Mark an instance as being torn down and return it
    pub async fn begin_removal(&self, id: &str) -> Result<ServiceInstance> {
        let mut slots = self.slots.write().await;
        match slots.remove(id) {
            Some(Slot::Ready(tracked)) => {
                let instance = tracked.instance.clone();
                slots.insert(id.to_string(), Slot::Deprovisioning(tracked));
                Ok(instance)
            }
            Some(other) => {
                let err = match other {
                    Slot::Provisioning => BrokerError::NotFound(id.to_string()),
                    _ => BrokerError::OperationInProgress(id.to_string()),
                };
                slots.insert(id.to_string(), other);
                Err(err)
            }
            None => Err(BrokerError::NotFound(id.to_string())),
        }
    }

    /// Teardown succeeded; forget the instance
    pub async fn finish_removal(&self, id: &str) {
        let mut slots = self.slots.write().await;
        if matches!(slots.get(id), Some(Slot::Deprovisioning(_))) {
            slots.remove(id);
        }
    }

    /// Teardown failed; make the instance available again so removal can be retried
    pub async fn abort_removal(&self, id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(Slot::Deprovisioning(tracked)) = slots.remove(id) {
            slots.insert(id.to_string(), Slot::Ready(tracked));
        }
    }

    /// Replace the stored credential of the instance a bind was decided on.
    ///
    /// Refused with `NotFound` if `id` now names a different instance.
    pub async fn store_credential(
        &self,
        id: &str,
        generation: u64,
        credential: Credential,
    ) -> Result<()> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(id) {
            Some(Slot::Ready(tracked)) if tracked.generation == generation => {
                tracked.instance.credential = Some(credential);
                Ok(())
            }
            Some(Slot::Deprovisioning(tracked)) if tracked.generation == generation => {
                Err(BrokerError::OperationInProgress(id.to_string()))
            }
            _ => Err(BrokerError::NotFound(id.to_string())),
        }
    }

    /// Number of visible instances
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots
            .values()
            .filter(|slot| !matches!(slot, Slot::Provisioning))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
