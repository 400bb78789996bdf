//! Class-of-Service registry.
//!
//! The registry owns the finite pool of hardware CLOS identifiers. Ids move
//! between the available and in-use sets; at most one id is additionally
//! designated as the shared reclaim class, reused by every shared-pool
//! consumer. The full set is established once at startup from the
//! hardware-reported class count and only shrinks at process shutdown.

use std::collections::VecDeque;

use cachet_common::{CachetError, CachetResult};
use parking_lot::Mutex;

/// Registry of hardware Class-of-Service identifiers.
///
/// All operations serialize on an internal mutex; no caller can observe a
/// torn state. After every call `available ∩ in_use = ∅` and
/// `|available| + |in_use|` equals the constructed total.
#[derive(Debug)]
pub struct ClosRegistry {
    inner: Mutex<Slots>,
}

#[derive(Debug)]
struct Slots {
    available: VecDeque<String>,
    in_use: Vec<String>,
    shared: Option<String>,
}

impl ClosRegistry {
    /// Build a registry over an explicit id list, reserved in list order.
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(Slots {
                available: ids.into_iter().collect(),
                in_use: Vec::new(),
                shared: None,
            }),
        }
    }

    /// Build a registry for a hardware class count, generating
    /// `COS0..COS{count-1}`.
    #[must_use]
    pub fn for_class_count(count: u32) -> Self {
        Self::new((0..count).map(|ordinal| format!("COS{ordinal}")))
    }

    /// Reserve the next free id.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::ResourceExhausted`] when no id is free.
    pub fn acquire(&self) -> CachetResult<String> {
        let mut slots = self.inner.lock();
        let id = slots
            .available
            .pop_front()
            .ok_or_else(|| CachetError::ResourceExhausted {
                resource: "CLOS".to_string(),
            })?;
        slots.in_use.push(id.clone());
        tracing::debug!(clos = %id, "Reserved CLOS");
        Ok(id)
    }

    /// Return a previously reserved id to the free pool.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidState`] for the shared id (it is
    /// reused, never returned) and [`CachetError::NotFound`] for an id that
    /// is not currently in use — including a double release. A failed call
    /// leaves the registry unchanged.
    pub fn release(&self, id: &str) -> CachetResult<()> {
        let mut slots = self.inner.lock();
        if slots.shared.as_deref() == Some(id) {
            return Err(CachetError::InvalidState {
                message: format!("shared CLOS {id} cannot be released"),
            });
        }
        let Some(position) = slots.in_use.iter().position(|used| used == id) else {
            return Err(CachetError::NotFound {
                what: format!("in-use CLOS {id}"),
            });
        };
        slots.in_use.remove(position);
        slots.available.push_back(id.to_string());
        tracing::debug!(clos = %id, "Returned CLOS");
        Ok(())
    }

    /// Get the shared reclaim class, designating one lazily on first call.
    /// Subsequent calls return the same id without consuming from the free
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::ResourceExhausted`] when none was designated
    /// yet and no id is free.
    pub fn acquire_shared(&self) -> CachetResult<String> {
        let mut slots = self.inner.lock();
        if let Some(shared) = &slots.shared {
            return Ok(shared.clone());
        }
        let id = slots
            .available
            .pop_front()
            .ok_or_else(|| CachetError::ResourceExhausted {
                resource: "CLOS".to_string(),
            })?;
        slots.in_use.push(id.clone());
        slots.shared = Some(id.clone());
        tracing::debug!(clos = %id, "Designated shared CLOS");
        Ok(id)
    }

    /// The shared id, if one has been designated.
    #[must_use]
    pub fn shared(&self) -> Option<String> {
        self.inner.lock().shared.clone()
    }

    /// Number of free ids.
    #[must_use]
    pub fn count_available(&self) -> usize {
        self.inner.lock().available.len()
    }

    /// Snapshot of the free ids. The returned vector is a copy; mutating it
    /// never affects the registry.
    #[must_use]
    pub fn list_available(&self) -> Vec<String> {
        self.inner.lock().available.iter().cloned().collect()
    }

    /// Snapshot of the reserved ids. The returned vector is a copy.
    #[must_use]
    pub fn list_in_use(&self) -> Vec<String> {
        self.inner.lock().in_use.clone()
    }
}
