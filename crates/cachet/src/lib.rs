//! # Cachet Allocation Engine
//!
//! Cachet partitions hardware cache ways and memory bandwidth (Intel RDT:
//! CAT, CDP and MBA) among workloads on a multi-tenant Linux host.
//!
//! ## Components
//!
//! - **Feature probing**: read-only detection of hardware flags and the
//!   resctrl mount state
//! - **CLOS registry**: concurrency-safe ownership of the finite
//!   class-of-service pool
//! - **Partition planner**: way-range and bandwidth-throttle computation
//!   under the configured pool policy
//! - **Resctrl driver**: materialization of classes as kernel resource
//!   groups (schemata + task membership)
//! - **Affinity binding**: CPU pinning consistent with the allocation
//!
//! ## Usage
//!
//! ```no_run
//! use cachet::engine::{AllocationRequest, Engine};
//! use cachet::plan::{MbaRequest, PoolKind};
//! use cachet_common::CachetConfig;
//!
//! # fn example() -> cachet_common::CachetResult<()> {
//! let config = CachetConfig::default();
//! let mut engine = Engine::bootstrap(&config)?;
//! engine.setup_os_group()?;
//! engine.setup_infra_group()?;
//!
//! let granted = engine.allocate(&AllocationRequest {
//!     name: "workload-1".to_string(),
//!     kind: PoolKind::Guaranteed,
//!     ways: 4,
//!     mba: MbaRequest::None,
//!     tasks: vec!["12345".to_string()],
//!     cpus: Some("2-3".to_string()),
//! })?;
//! println!("{} -> {}", granted.name, granted.clos);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod affinity;
pub mod clos;
pub mod engine;
pub mod plan;
pub mod probe;
pub mod resctrl;

pub use engine::Engine;
