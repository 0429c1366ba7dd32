//! cgroup v2 placement and resource caps (§4.1).
//!
//! One cgroup per container, named after its id, created through `cgroups-rs`'s
//! hierarchy auto-detection (cgroup v2 on any host this daemon targets).

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::{Cgroup, CgroupPid, MaxValue};
use log::warn;

use super::config::Limits;
use super::error::{PhiockerError, Result};

const DEFAULT_CPU_QUOTA: i64 = 50_000;
const DEFAULT_CPU_PERIOD: u64 = 100_000;
const DEFAULT_MEMORY: i64 = 100 * 1024 * 1024;
const DEFAULT_PIDS: i64 = 20;

/// Build the container's cgroup and place `pid` into it. The cgroup is left
/// unattached to any controller hierarchy if this fails partway, so the
/// caller should treat any error here as fatal to the launch.
pub fn setup(container_id: &str, pid: i32, limits: &Limits) -> Result<Cgroup> {
    let hier = cgroups_rs::hierarchies::auto();
    let cg = CgroupBuilder::new(container_id)
        .cpu()
        .quota(limits.cpu_quota.map(|v| v as i64).unwrap_or(DEFAULT_CPU_QUOTA))
        .period(limits.cpu_period.unwrap_or(DEFAULT_CPU_PERIOD))
        .done()
        .memory()
        .memory_hard_limit(limits.memory.map(|v| v as i64).unwrap_or(DEFAULT_MEMORY))
        .done()
        .pid()
        .maximum_number_of_processes(MaxValue::Value(
            limits.pids.map(|v| v as i64).unwrap_or(DEFAULT_PIDS),
        ))
        .done()
        .build(hier)
        .map_err(|e| PhiockerError::system(format!("failed to create cgroup: {e}")))?;

    if let Err(e) = cg.add_task_by_tgid(CgroupPid::from(pid as u64)) {
        let _ = cg.delete();
        return Err(PhiockerError::system(format!(
            "failed to place pid {pid} into cgroup: {e}"
        )));
    }

    Ok(cg)
}

/// Tear down a container's cgroup. Tolerates the controller already being
/// gone or briefly busy while the kernel finishes reaping recently-exited
/// processes (§9) — retried a handful of times before giving up.
pub fn teardown(cg: Cgroup) {
    const ATTEMPTS: u32 = 5;
    for attempt in 0..ATTEMPTS {
        match cg.delete() {
            Ok(()) => return,
            Err(e) => {
                if attempt + 1 == ATTEMPTS {
                    warn!("failed to delete cgroup: {e}");
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(50 * (attempt as u64 + 1)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_reasonable() {
        assert!(DEFAULT_CPU_QUOTA > 0);
        assert!(DEFAULT_MEMORY > 0);
        assert!(DEFAULT_PIDS > 0);
        let _ = Limits::default();
    }
}
