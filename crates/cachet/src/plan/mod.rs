//! Cache-way and memory-bandwidth partition planning.
//!
//! The planner is a pure function of the configured pool policy and a live
//! usage snapshot; it owns no persistent state. All validation happens
//! before the caller writes anything, so a failed plan never leaves a
//! partial mask applied.
//!
//! Way layout: the guaranteed region sits at the low end of the way range,
//! the best-effort region follows it, and the shared region occupies the
//! high end. Guaranteed masks never overlap any other pool; best-effort
//! masks may overlap the shared region and each other.

use cachet_common::{Bitmap, CachePool, CachetError, CachetResult};

use crate::probe::RdtCapabilities;

/// Pool membership of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Exclusive ways, never overlapped.
    Guaranteed,
    /// Overlappable ways from the best-effort pool.
    BestEffort,
    /// Ways from the shared pool, riding the single shared CLOS.
    Shared,
}

/// A contiguous run of cache ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WayRange {
    /// First way of the run.
    pub offset: u32,
    /// Number of ways.
    pub count: u32,
}

impl WayRange {
    /// One past the last way of the run.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.offset + self.count
    }

    /// Whether two runs share any way.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Render the run as a way mask of the given width.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidBit`] if the run exceeds `width`.
    pub fn to_bitmap(&self, width: usize) -> CachetResult<Bitmap> {
        Bitmap::contiguous(width, self.offset as usize, self.count as usize)
    }
}

/// Live snapshot of way commitments the planner computes against. The
/// caller (one allocation transaction at a time) maintains it.
#[derive(Debug, Clone, Default)]
pub struct WayUsage {
    /// Exclusive guaranteed runs currently in effect.
    pub guaranteed: Vec<WayRange>,
    /// Ways currently committed to best-effort consumers.
    pub besteffort_taken: u32,
}

impl WayUsage {
    /// Record a granted allocation.
    pub fn commit(&mut self, kind: PoolKind, range: WayRange) {
        match kind {
            PoolKind::Guaranteed => self.guaranteed.push(range),
            PoolKind::BestEffort => self.besteffort_taken += range.count,
            PoolKind::Shared => {}
        }
    }

    /// Forget a released allocation.
    pub fn revoke(&mut self, kind: PoolKind, range: WayRange) {
        match kind {
            PoolKind::Guaranteed => {
                if let Some(position) = self.guaranteed.iter().position(|held| *held == range) {
                    self.guaranteed.remove(position);
                }
            }
            PoolKind::BestEffort => {
                self.besteffort_taken = self.besteffort_taken.saturating_sub(range.count);
            }
            PoolKind::Shared => {}
        }
    }
}

/// The three pool regions laid out over the way range.
#[derive(Debug, Clone, Copy)]
pub struct PoolLayout {
    /// Guaranteed region at the low end.
    pub guaranteed: WayRange,
    /// Best-effort region after the guaranteed one.
    pub besteffort: WayRange,
    /// Shared region at the high end.
    pub shared: WayRange,
}

/// Memory-bandwidth request, resolved per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MbaRequest {
    /// No throttling for this class.
    #[default]
    None,
    /// Throttle to a 0-100 percentage.
    Percentage(u32),
    /// Throttle to an absolute ceiling in MBps.
    Mbps(u32),
}

/// A throttle value destined for the `MB` schemata line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbaThrottle {
    /// Percentage throttle.
    Percentage(u32),
    /// Absolute MBps throttle.
    Mbps(u32),
}

impl MbaThrottle {
    /// The numeric value written to the schemata line.
    #[must_use]
    pub const fn value(&self) -> u32 {
        match self {
            Self::Percentage(value) | Self::Mbps(value) => *value,
        }
    }
}

/// Resolve a bandwidth request against the probed capabilities.
///
/// `None` disables throttling (no `MB` line is written, leaving the class
/// unthrottled). The percentage and MBps flavors must match the mount's
/// MBA mode.
///
/// # Errors
///
/// Returns [`CachetError::Unsupported`] when throttling is requested but
/// MBA is off or runs in the other flavor, and
/// [`CachetError::CapacityViolation`] for a percentage above 100.
pub fn plan_mba(
    request: MbaRequest,
    caps: &RdtCapabilities,
) -> CachetResult<Option<MbaThrottle>> {
    match request {
        MbaRequest::None => Ok(None),
        MbaRequest::Percentage(value) => {
            if !caps.mba_on || caps.mba_mbps {
                return Err(CachetError::Unsupported {
                    feature: "MBA percentage throttling".to_string(),
                });
            }
            if value > 100 {
                return Err(CachetError::CapacityViolation {
                    message: format!("MBA throttle {value}% exceeds 100%"),
                });
            }
            Ok(Some(MbaThrottle::Percentage(value)))
        }
        MbaRequest::Mbps(value) => {
            if !caps.mba_on || !caps.mba_mbps {
                return Err(CachetError::Unsupported {
                    feature: "MBA MBps throttling".to_string(),
                });
            }
            Ok(Some(MbaThrottle::Mbps(value)))
        }
    }
}

/// Plans way ranges for allocation requests against the configured pool
/// policy.
#[derive(Debug, Clone)]
pub struct PartitionPlanner {
    total_ways: u32,
    offset: u32,
    pool: CachePool,
}

impl PartitionPlanner {
    /// Build a planner over `total_ways` ways starting at `offset` (ways
    /// below the offset are reserved for the OS and infra groups).
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::CapacityViolation`] when the configured
    /// guaranteed and shared pools cannot coexist within `total_ways`.
    pub fn new(total_ways: u32, offset: u32, pool: CachePool) -> CachetResult<Self> {
        if pool.guarantee + pool.shared > total_ways {
            return Err(CachetError::CapacityViolation {
                message: format!(
                    "guarantee ({}) + shared ({}) pools exceed {total_ways} ways",
                    pool.guarantee, pool.shared
                ),
            });
        }
        Ok(Self {
            total_ways,
            offset,
            pool,
        })
    }

    /// Total ways the planner partitions.
    #[must_use]
    pub const fn total_ways(&self) -> u32 {
        self.total_ways
    }

    /// The configured pool policy.
    #[must_use]
    pub const fn pool(&self) -> &CachePool {
        &self.pool
    }

    fn guaranteed_end(&self) -> u32 {
        self.offset + self.pool.guarantee
    }

    fn besteffort_end(&self) -> u32 {
        self.offset + (self.pool.guarantee + self.pool.besteffort).min(self.total_ways)
    }

    fn shared_start(&self) -> u32 {
        self.offset + self.total_ways - self.pool.shared
    }

    /// The three pool regions.
    #[must_use]
    pub fn layout(&self) -> PoolLayout {
        PoolLayout {
            guaranteed: WayRange {
                offset: self.offset,
                count: self.pool.guarantee,
            },
            besteffort: WayRange {
                offset: self.guaranteed_end(),
                count: self.besteffort_end() - self.guaranteed_end(),
            },
            shared: WayRange {
                offset: self.shared_start(),
                count: self.pool.shared,
            },
        }
    }

    /// Plan a way range for a request of `ways` ways from the given pool.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::CapacityViolation`] when the request cannot
    /// be placed and [`CachetError::PolicyViolation`] when a shared
    /// consumer exceeds `max_allowed_shared`.
    pub fn plan_ways(&self, kind: PoolKind, ways: u32, usage: &WayUsage) -> CachetResult<WayRange> {
        if ways == 0 {
            return Err(CachetError::CapacityViolation {
                message: "request for zero cache ways".to_string(),
            });
        }
        let range = match kind {
            PoolKind::Guaranteed => self.plan_guaranteed(ways, usage),
            PoolKind::BestEffort => self.plan_besteffort(ways, usage),
            PoolKind::Shared => self.plan_shared(ways),
        }?;
        tracing::debug!(?kind, ways, offset = range.offset, "Planned way range");
        Ok(range)
    }

    fn plan_guaranteed(&self, ways: u32, usage: &WayUsage) -> CachetResult<WayRange> {
        // The nominal best-effort and shared pools must stay placeable no
        // matter how the request is satisfied; shrink does not relax this.
        if ways + self.pool.besteffort > self.total_ways
            || ways + self.pool.shared > self.total_ways
        {
            return Err(CachetError::CapacityViolation {
                message: format!(
                    "guarantee of {ways} ways does not fit beside the configured pools \
                     ({} best-effort, {} shared, {} total)",
                    self.pool.besteffort, self.pool.shared, self.total_ways
                ),
            });
        }

        let window_end = if self.pool.shrink {
            self.besteffort_end()
        } else {
            self.guaranteed_end()
        };
        first_fit(ways, self.offset, window_end, &usage.guaranteed)
            .ok_or_else(|| CachetError::CapacityViolation {
                message: format!(
                    "no contiguous run of {ways} free ways in the guaranteed pool \
                     (shrink: {})",
                    self.pool.shrink
                ),
            })
    }

    fn plan_besteffort(&self, ways: u32, usage: &WayUsage) -> CachetResult<WayRange> {
        // Guaranteed runs that reclaimed best-effort ways re-anchor the
        // pool so best-effort masks never overlap a guarantee.
        let base = usage
            .guaranteed
            .iter()
            .map(WayRange::end)
            .max()
            .unwrap_or(0)
            .max(self.guaranteed_end());
        let capacity = self.besteffort_end().saturating_sub(base);
        let free = capacity.saturating_sub(usage.besteffort_taken);

        if ways > capacity || (ways > free && !self.pool.shrink) {
            return Err(CachetError::CapacityViolation {
                message: format!(
                    "best-effort request of {ways} ways exceeds {} free of {capacity} \
                     (shrink: {})",
                    free, self.pool.shrink
                ),
            });
        }
        Ok(WayRange {
            offset: base,
            count: ways,
        })
    }

    fn plan_shared(&self, ways: u32) -> CachetResult<WayRange> {
        if ways > self.pool.max_allowed_shared {
            return Err(CachetError::PolicyViolation {
                message: format!(
                    "shared request of {ways} ways exceeds max_allowed_shared ({})",
                    self.pool.max_allowed_shared
                ),
            });
        }
        if ways > self.pool.shared {
            return Err(CachetError::CapacityViolation {
                message: format!(
                    "shared request of {ways} ways exceeds the shared pool ({})",
                    self.pool.shared
                ),
            });
        }
        Ok(WayRange {
            offset: self.shared_start(),
            count: ways,
        })
    }
}

// First-fit search for a free contiguous run within [start, end), skipping
// past every committed guaranteed range.
fn first_fit(ways: u32, start: u32, end: u32, committed: &[WayRange]) -> Option<WayRange> {
    let mut candidate = start;
    while candidate + ways <= end {
        let range = WayRange {
            offset: candidate,
            count: ways,
        };
        match committed
            .iter()
            .filter(|held| held.overlaps(&range))
            .max_by_key(|held| held.end())
        {
            None => return Some(range),
            Some(blocking) => candidate = blocking.end(),
        }
    }
    None
}
