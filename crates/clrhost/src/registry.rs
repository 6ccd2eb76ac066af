//! Process-wide slots for hosts that may be initialized only once.
//!
//! The slot lock is held for the whole initialization, so when several
//! threads race to construct the same host the first one initializes it and
//! the rest observe its result.

use std::fmt::Debug;
use std::sync::Arc;

use clrhost_shared::{Error, Result, RuntimeKind};
use parking_lot::Mutex;
use tracing::{debug, warn};

enum Slot<H, C> {
    Vacant,
    Live { host: Arc<H>, config: C },
    /// Shut down; the hosting ABI cannot start again in this process.
    Retired,
}

pub struct HostRegistry<H, C> {
    kind: RuntimeKind,
    slot: Mutex<Slot<H, C>>,
}

impl<H, C: Clone + PartialEq + Debug> HostRegistry<H, C> {
    pub const fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            slot: parking_lot::const_mutex(Slot::Vacant),
        }
    }

    /// Return the live host, initializing it with `init` if the slot is empty.
    ///
    /// With a live host and an equal `config` the existing host is shared.
    /// With a different `config`, `reconcile(host, existing_config)` decides:
    /// `Ok(())` shares the host, an error is returned to the caller as is.
    pub fn get_or_init(
        &self,
        config: &C,
        init: impl FnOnce() -> Result<H>,
        reconcile: impl FnOnce(&H, &C) -> Result<()>,
    ) -> Result<Arc<H>> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Live {
                host,
                config: existing,
            } => {
                if existing == config {
                    debug!(kind = %self.kind, "reusing initialized host");
                    return Ok(Arc::clone(host));
                }
                reconcile(host, existing)?;
                debug!(kind = %self.kind, "sharing host initialized with a compatible configuration");
                Ok(Arc::clone(host))
            }
            Slot::Retired => Err(Error::HostInitializationConflict {
                kind: self.kind,
                detail: "the host was shut down and cannot be initialized again in this process"
                    .into(),
            }),
            Slot::Vacant => {
                let host = Arc::new(init()?);
                *slot = Slot::Live {
                    host: Arc::clone(&host),
                    config: config.clone(),
                };
                Ok(host)
            }
        }
    }

    /// Retire the slot if `host` is live and no other handle shares it.
    ///
    /// Returns `false` while other handles exist or when `host` is not the
    /// live host; the caller then leaves the native host running.
    pub fn retire_if_last(&self, host: &Arc<H>) -> bool {
        let mut slot = self.slot.lock();
        let Slot::Live { host: live, .. } = &*slot else {
            warn!(kind = %self.kind, "shutdown of a host that is not live");
            return false;
        };
        if !Arc::ptr_eq(live, host) {
            warn!(kind = %self.kind, "shutdown of a host that is not live");
            return false;
        }
        // One reference is the slot's, one is the caller's.
        if Arc::strong_count(host) > 2 {
            debug!(kind = %self.kind, "host still shared, leaving it running");
            return false;
        }
        *slot = Slot::Retired;
        true
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<Arc<H>> {
        match &*self.slot.lock() {
            Slot::Live { host, .. } => Some(Arc::clone(host)),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_retired(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Retired)
    }

    /// Number of handles sharing the live host, including the registry's own.
    #[cfg(test)]
    pub fn strong_count(&self) -> usize {
        match &*self.slot.lock() {
            Slot::Live { host, .. } => Arc::strong_count(host),
            _ => 0,
        }
    }
}
