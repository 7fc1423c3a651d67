//! CPU pinning for the shard worker.

use tracing::{info, warn};

/// Pin the calling thread to `core`.
pub fn pin_to_core(core: usize) {
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc == 0 {
        info!(core, "shard worker pinned");
    } else {
        warn!(core, errno = unsafe { *libc::__errno_location() }, "pin failed");
    }
}
