use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::ChatError;

/// RAII guard that releases the generation slot when dropped.
///
/// Hold it until the generation it admitted has fully returned.
pub(crate) struct Permit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Single-slot admission control: at most one generation per session.
///
/// Contention is rejected immediately with [`ChatError::Busy`]; requests are
/// never queued.
#[derive(Debug, Clone)]
pub(crate) struct AdmissionGate {
    semaphore: Arc<Semaphore>,
}

impl AdmissionGate {
    pub(crate) fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub(crate) fn try_acquire(&self) -> Result<Permit, ChatError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map(|permit| Permit { permit })
            .map_err(|_| ChatError::Busy)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
