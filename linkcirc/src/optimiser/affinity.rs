//! Best-effort pinning of worker threads to CPU cores.
//!
//! Workers are spread round-robin over the physical cores. On Linux the
//! core topology is read from sysfs, and the lowest-numbered logical CPU of
//! every `(package, core)` pair stands for that core. Elsewhere, or when
//! sysfs is unreadable, logical CPUs `0..physical` are assumed to sit on
//! distinct cores.

/// One logical CPU per physical core, in ascending order.
pub fn physical_cpus() -> Vec<usize> {
    #[cfg(target_os = "linux")]
    {
        if let Some(cpus) = sysfs::physical_cpus() {
            return cpus;
        }
    }
    (0..num_cpus::get_physical().max(1)).collect()
}

/// The logical CPU a worker is pinned to.
pub fn core_for_worker(worker: usize) -> usize {
    let cpus = physical_cpus();
    cpus.get(worker % cpus.len().max(1)).copied().unwrap_or(0)
}

/// Pin the calling thread to the core of `worker`.
///
/// Returns whether the thread was pinned. Platforms without affinity support
/// always return `false`.
pub fn pin_current_thread(worker: usize) -> bool {
    pin_to_cpu(core_for_worker(worker))
}

#[cfg(target_os = "linux")]
mod sysfs {
    use std::fs;
    use std::path::Path;

    use fxhash::FxHashSet;

    const CPU_ROOT: &str = "/sys/devices/system/cpu";

    pub(super) fn physical_cpus() -> Option<Vec<usize>> {
        let mut cpus: Vec<usize> = fs::read_dir(CPU_ROOT)
            .ok()?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                name.to_str()?.strip_prefix("cpu")?.parse().ok()
            })
            .collect();
        cpus.sort_unstable();

        let mut cores = FxHashSet::default();
        let mut firsts = Vec::new();
        for cpu in cpus {
            let topology = Path::new(CPU_ROOT).join(format!("cpu{cpu}/topology"));
            // Offline CPUs have no topology directory.
            let (Some(package), Some(core)) = (
                read_id(&topology.join("physical_package_id")),
                read_id(&topology.join("core_id")),
            ) else {
                continue;
            };
            if cores.insert((package, core)) {
                firsts.push(cpu);
            }
        }
        (!firsts.is_empty()).then_some(firsts)
    }

    fn read_id(path: &Path) -> Option<i64> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

#[cfg(all(feature = "affinity", target_os = "linux"))]
fn pin_to_cpu(cpu: usize) -> bool {
    // SAFETY: `cpu_set_t` is plain data, and `sched_setaffinity` only reads
    // the set we pass, for the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(all(feature = "affinity", target_os = "linux")))]
fn pin_to_cpu(_cpu: usize) -> bool {
    false
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn one_cpu_per_core() {
        let cpus = physical_cpus();
        assert!(!cpus.is_empty());
        assert!(cpus.iter().tuple_windows().all(|(a, b)| a < b));
    }

    #[test]
    fn round_robin() {
        let cpus = physical_cpus();
        assert_eq!(core_for_worker(0), cpus[0]);
        assert_eq!(core_for_worker(cpus.len()), cpus[0]);
        assert!(cpus.contains(&core_for_worker(cpus.len() + 1)));
    }

    #[test]
    fn pinning_is_best_effort() {
        // Must not panic, whatever the platform allows.
        let handle = std::thread::spawn(|| pin_current_thread(1));
        handle.join().unwrap();
    }
}
