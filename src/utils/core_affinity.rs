//! CPU core affinity pinning for worker threads.
//!
//! Linux-only; on other platforms `get_core_ids` returns a single pseudo-core
//! and pinning calls are no-ops, matching the non-Linux code paths elsewhere
//! in this crate (see the `target_os = "linux"` gate on `TLSMode::VerifyFull`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreId {
    pub id: usize,
}

#[cfg(target_os = "linux")]
pub fn get_core_ids() -> Option<Vec<CoreId>> {
    let n = num_cpus::get();
    if n == 0 {
        return None;
    }
    Some((0..n).map(|id| CoreId { id }).collect())
}

#[cfg(not(target_os = "linux"))]
pub fn get_core_ids() -> Option<Vec<CoreId>> {
    Some(vec![CoreId { id: 0 }])
}

#[cfg(target_os = "linux")]
pub fn set_for_current(core: CoreId) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core.id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_for_current(_core: CoreId) {}

#[cfg(target_os = "linux")]
pub fn clear_for_current() {
    if let Some(core_ids) = get_core_ids() {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for core in &core_ids {
                libc::CPU_SET(core.id, &mut set);
            }
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn clear_for_current() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_least_one_core() {
        let ids = get_core_ids().unwrap();
        assert!(!ids.is_empty());
    }
}
