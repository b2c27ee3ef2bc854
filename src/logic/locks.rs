use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::Id;

/// Advisory locks keyed by service-instance id.
///
/// Serializes reconciliations inside one server process only; two processes
/// sharing a store can still race.
#[derive(Debug, Default)]
pub struct ServiceInstanceLocks {
    slots: Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>,
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct ServiceInstanceLease {
    ids: Vec<Id>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ServiceInstanceLease {
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }
}

impl ServiceInstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: Id) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        // drop slots nobody holds or waits on
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.entry(id).or_default().clone()
    }

    /// Lock several service instances, always in ascending id order.
    pub async fn acquire(&self, ids: &[Id]) -> ServiceInstanceLease {
        let ordered: Vec<Id> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for &id in &ordered {
            guards.push(self.slot(id).lock_owned().await);
        }
        ServiceInstanceLease {
            ids: ordered,
            _guards: guards,
        }
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.slots.lock().len()
    }
}
