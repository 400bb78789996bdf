//! Allocation transactions.
//!
//! The [`Engine`] is constructed once at startup and threads the probed
//! capabilities, the CLOS registry, the partition planner and the resctrl
//! driver through each allocation. Transactions are serialized on an
//! internal mutex so no two requests ever compute masks against a stale
//! usage snapshot; all validation happens before the first filesystem
//! write.

use std::collections::HashMap;

use cachet_common::{
    AFFINITY_BITS, Bitmap, CachetConfig, CachetError, CachetResult, InfraGroup, OsGroup,
};
use parking_lot::Mutex;

use crate::affinity;
use crate::clos::ClosRegistry;
use crate::plan::{MbaRequest, PartitionPlanner, PoolKind, WayRange, WayUsage, plan_mba};
use crate::probe::{self, RdtCapabilities};
use crate::resctrl::{L3, L3_CODE, L3_DATA, ROOT_GROUP, ResAssociation, ResctrlDriver, Schemata};

/// Group name used for the infrastructure group.
pub const INFRA_GROUP: &str = "infra";

// Names that can never be user allocations.
const RESERVED_NAMES: [&str; 4] = [INFRA_GROUP, "info", "mon_data", "mon_groups"];

/// An allocation request entering the engine.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Resctrl group name to materialize.
    pub name: String,
    /// Pool the request draws from.
    pub kind: PoolKind,
    /// Requested cache ways.
    pub ways: u32,
    /// Requested bandwidth throttle.
    pub mba: MbaRequest,
    /// PIDs to bind to the group.
    pub tasks: Vec<String>,
    /// Optional CPU list to pin the bound tasks to.
    pub cpus: Option<String>,
}

/// A granted allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// The materialized group name.
    pub name: String,
    /// The class of service backing the group.
    pub clos: String,
    /// The granted way range.
    pub ways: WayRange,
    /// The way mask written to the schemata.
    pub mask: Bitmap,
}

#[derive(Debug, Clone)]
struct AllocationRecord {
    clos: String,
    kind: PoolKind,
    ways: WayRange,
    shared: bool,
}

#[derive(Debug, Default)]
struct Transactions {
    usage: WayUsage,
    allocations: HashMap<String, AllocationRecord>,
}

/// The allocation engine.
#[derive(Debug)]
pub struct Engine {
    caps: RdtCapabilities,
    registry: ClosRegistry,
    planner: PartitionPlanner,
    driver: ResctrlDriver,
    os_group: OsGroup,
    os_cpus: Bitmap,
    infra_group: Option<InfraGroup>,
    infra_clos: Option<String>,
    cache_domains: Vec<u32>,
    cbm_len: u32,
    os_clos: String,
    txn: Mutex<Transactions>,
}

impl Engine {
    /// Probe the host and open the engine over the configured control
    /// root. The root not being resctrl-mounted is an error — the daemon
    /// treats it as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::Unsupported`] for a missing mount and
    /// surfaces probe or sizing failures.
    pub fn bootstrap(config: &CachetConfig) -> CachetResult<Self> {
        let root = config.resctrl_root();
        if !probe::is_resctrl_mounted(&root) {
            return Err(CachetError::Unsupported {
                feature: format!("resctrl filesystem mounted at {}", root.display()),
            });
        }
        let caps = RdtCapabilities::probe(&root)?;
        Self::open(config, caps)
    }

    /// Open the engine over the configured control root with an already
    /// probed capability snapshot, sizing the registry and planner from
    /// the kernel's info directory.
    ///
    /// # Errors
    ///
    /// Surfaces sizing, configuration and filesystem failures.
    pub fn open(config: &CachetConfig, caps: RdtCapabilities) -> CachetResult<Self> {
        caps.check_mba_mode(config.rdt.mba_mode)?;

        let driver = ResctrlDriver::new(config.resctrl_root());
        let cos = driver.read_cos_info()?;
        let cache_domains = cache_domains(&driver.read_group(ROOT_GROUP)?)?;

        let os_group = config.os_group.clone();
        let os_cpus = Bitmap::from_cpulist(&os_group.cpuset, AFFINITY_BITS)?;
        let infra_group = config.infra_group.clone();
        if infra_group.as_ref().is_some_and(|infra| infra.cacheways == 0) {
            return Err(CachetError::Config {
                message: "InfraGroup.cacheways must be at least 1 when the section is present"
                    .to_string(),
            });
        }

        let reserved = os_group.cacheways + infra_group.as_ref().map_or(0, |infra| infra.cacheways);
        if reserved >= cos.cbm_len {
            return Err(CachetError::CapacityViolation {
                message: format!(
                    "OS and infra groups reserve {reserved} of {} total ways",
                    cos.cbm_len
                ),
            });
        }
        let planner = PartitionPlanner::new(
            cos.cbm_len - reserved,
            reserved,
            config.cache_pool.clone(),
        )?;

        let registry = ClosRegistry::for_class_count(cos.num_closids);
        // The OS group rides the root group's default class.
        let os_clos = registry.acquire()?;

        tracing::info!(
            cbm_len = cos.cbm_len,
            num_closids = cos.num_closids,
            domains = ?cache_domains,
            "Opened allocation engine"
        );

        Ok(Self {
            caps,
            registry,
            planner,
            driver,
            os_group,
            os_cpus,
            infra_group,
            infra_clos: None,
            cache_domains,
            cbm_len: cos.cbm_len,
            os_clos,
            txn: Mutex::new(Transactions::default()),
        })
    }

    /// The probed capability snapshot.
    #[must_use]
    pub const fn caps(&self) -> &RdtCapabilities {
        &self.caps
    }

    /// The CLOS registry.
    #[must_use]
    pub const fn registry(&self) -> &ClosRegistry {
        &self.registry
    }

    /// The partition planner.
    #[must_use]
    pub const fn planner(&self) -> &PartitionPlanner {
        &self.planner
    }

    /// The class backing the OS/root group.
    #[must_use]
    pub fn os_clos(&self) -> &str {
        &self.os_clos
    }

    /// The class backing the infra group, once materialized.
    #[must_use]
    pub fn infra_clos(&self) -> Option<&str> {
        self.infra_clos.as_deref()
    }

    /// The CPU set reserved for the OS group.
    #[must_use]
    pub const fn os_cpus(&self) -> &Bitmap {
        &self.os_cpus
    }

    fn cache_schemata(&self, mask: &Bitmap) -> Schemata {
        let mut schemata = Schemata::new();
        if self.caps.cdp_on {
            schemata.push_cache(L3_CODE, &self.cache_domains, mask);
            schemata.push_cache(L3_DATA, &self.cache_domains, mask);
        } else {
            schemata.push_cache(L3, &self.cache_domains, mask);
        }
        schemata
    }

    /// Apply the OS group's way mask to the root group.
    ///
    /// # Errors
    ///
    /// Surfaces mask construction and filesystem failures.
    pub fn setup_os_group(&self) -> CachetResult<()> {
        let mask = Bitmap::contiguous(self.cbm_len as usize, 0, self.os_group.cacheways as usize)?;
        self.driver.apply(ROOT_GROUP, &self.cache_schemata(&mask))?;
        tracing::info!(
            cacheways = self.os_group.cacheways,
            cpuset = %self.os_group.cpuset,
            "Applied OS group"
        );
        Ok(())
    }

    /// Materialize the infra group when configured: acquire its class,
    /// apply its mask after the OS ways, bind the PIDs of processes whose
    /// command lines match the configured task names, and pin them to the
    /// configured CPU set.
    ///
    /// # Errors
    ///
    /// Surfaces registry, filesystem and affinity failures.
    pub fn setup_infra_group(&mut self) -> CachetResult<()> {
        let Some(infra) = self.infra_group.clone() else {
            tracing::debug!("Infra group not configured");
            return Ok(());
        };

        let clos = self.registry.acquire()?;
        let mask = Bitmap::contiguous(
            self.cbm_len as usize,
            self.os_group.cacheways as usize,
            infra.cacheways as usize,
        )?;
        self.driver.apply(INFRA_GROUP, &self.cache_schemata(&mask))?;

        let mut pids: Vec<i32> = probe::list_processes()
            .values()
            .filter(|process| {
                infra
                    .tasks
                    .iter()
                    .any(|needle| process.cmdline.contains(needle))
            })
            .map(|process| process.pid)
            .collect();
        pids.sort_unstable();
        let pids: Vec<String> = pids.iter().map(ToString::to_string).collect();
        self.driver.bind(INFRA_GROUP, &pids)?;

        if !infra.cpuset.is_empty() {
            let cpus = Bitmap::from_cpulist(&infra.cpuset, AFFINITY_BITS)?;
            for pid in &pids {
                affinity::set_affinity(pid, &cpus)?;
            }
        }

        tracing::info!(
            clos = %clos,
            cacheways = infra.cacheways,
            tasks = pids.len(),
            "Applied infra group"
        );
        self.infra_clos = Some(clos);
        Ok(())
    }

    /// Run one allocation transaction: plan masks, reserve a class, apply
    /// the schemata, bind tasks and pin CPUs. Nothing is written until
    /// every check has passed; a failed write rolls the group back.
    ///
    /// # Errors
    ///
    /// Propagates planner, registry, filesystem and affinity failures.
    pub fn allocate(&self, request: &AllocationRequest) -> CachetResult<Allocation> {
        validate_group_name(&request.name)?;

        let mut txn = self.txn.lock();
        if txn.allocations.contains_key(&request.name) {
            return Err(CachetError::InvalidState {
                message: format!("group {} already allocated", request.name),
            });
        }

        // All validation up front; the first write happens below.
        let throttle = plan_mba(request.mba, &self.caps)?;
        let range = self.planner.plan_ways(request.kind, request.ways, &txn.usage)?;
        let mask = range.to_bitmap(self.cbm_len as usize)?;
        let cpus = request
            .cpus
            .as_deref()
            .map(|list| Bitmap::from_cpulist(list, AFFINITY_BITS))
            .transpose()?;

        let shared = request.kind == PoolKind::Shared;
        let clos = if shared {
            self.registry.acquire_shared()?
        } else {
            self.registry.acquire()?
        };

        let mut schemata = self.cache_schemata(&mask);
        if let Some(throttle) = throttle {
            schemata.push_throttle(&self.cache_domains, throttle.value());
        }

        let applied = self
            .driver
            .apply(&request.name, &schemata)
            .and_then(|()| self.driver.bind(&request.name, &request.tasks))
            .and_then(|()| {
                if let Some(cpus) = &cpus {
                    for pid in &request.tasks {
                        affinity::set_affinity(pid, cpus)?;
                    }
                }
                Ok(())
            });
        if let Err(error) = applied {
            self.rollback(&request.name, &clos, shared);
            return Err(error);
        }

        txn.usage.commit(request.kind, range);
        txn.allocations.insert(
            request.name.clone(),
            AllocationRecord {
                clos: clos.clone(),
                kind: request.kind,
                ways: range,
                shared,
            },
        );

        tracing::info!(
            group = %request.name,
            clos = %clos,
            kind = ?request.kind,
            ways = request.ways,
            mask = %mask,
            "Allocated"
        );
        Ok(Allocation {
            name: request.name.clone(),
            clos,
            ways: range,
            mask,
        })
    }

    // Undo a half-applied allocation. Best effort: the original error is
    // what the caller needs to see.
    fn rollback(&self, name: &str, clos: &str, shared: bool) {
        if let Err(error) = self.driver.remove(name) {
            tracing::warn!(group = %name, %error, "Rollback could not remove group");
        }
        if !shared {
            if let Err(error) = self.registry.release(clos) {
                tracing::warn!(clos = %clos, %error, "Rollback could not release CLOS");
            }
        }
    }

    /// Release an allocation: remove its group directory (the kernel moves
    /// its tasks back to the root group) and return its class. A failed
    /// removal leaves the engine state unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::NotFound`] for an unknown group and
    /// surfaces filesystem failures.
    pub fn release(&self, name: &str) -> CachetResult<()> {
        let mut txn = self.txn.lock();
        let record = txn
            .allocations
            .get(name)
            .cloned()
            .ok_or_else(|| CachetError::NotFound {
                what: format!("allocation {name}"),
            })?;

        self.driver.remove(name)?;
        if !record.shared {
            self.registry.release(&record.clos)?;
        }
        txn.usage.revoke(record.kind, record.ways);
        txn.allocations.remove(name);

        tracing::info!(group = %name, clos = %record.clos, "Released");
        Ok(())
    }

    /// Read the current associations back from the control filesystem,
    /// optionally restricted to groups matching `filter`.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem and parse failures.
    pub fn associations(
        &self,
        filter: Option<&str>,
    ) -> CachetResult<std::collections::BTreeMap<String, ResAssociation>> {
        self.driver.read_associations(filter)
    }
}

// Domain ids come from the root group's schemata: every group mirrors the
// kernel's domain list.
fn cache_domains(root: &ResAssociation) -> CachetResult<Vec<u32>> {
    let line = root
        .schemata
        .line(L3)
        .or_else(|| root.schemata.line(L3_CODE))
        .ok_or_else(|| CachetError::NotFound {
            what: "L3 line in the root schemata".to_string(),
        })?;
    Ok(line.domains.iter().map(|domain| domain.id).collect())
}

fn validate_group_name(name: &str) -> CachetResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if name.is_empty() || !valid_chars || RESERVED_NAMES.contains(&name) {
        return Err(CachetError::InvalidState {
            message: format!("invalid group name: {name:?}"),
        });
    }
    Ok(())
}
