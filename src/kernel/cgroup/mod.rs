//! Cgroup resource governance
//!
//! Bots run inside one cgroup v2 leaf each. The backend sets ceilings, reads the
//! accounting counters the resource monitor samples, and kills whole cgroups.

pub mod backend;
pub mod v2;

pub use backend::{create_cgroup_backend, CgroupBackend, CgroupCounters};
pub use v2::CgroupV2;
