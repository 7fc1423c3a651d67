//! Cache-line write-back for mapped pool memory.

use std::sync::OnceLock;

const CACHE_LINE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Clwb,
    ClflushOpt,
    Clflush,
}

static METHOD: OnceLock<Method> = OnceLock::new();

fn detect() -> Method {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::__cpuid;
        let cpuid_7 = __cpuid(7);
        if (cpuid_7.ebx & (1 << 24)) != 0 {
            return Method::Clwb;
        }
        if (cpuid_7.ebx & (1 << 23)) != 0 {
            return Method::ClflushOpt;
        }
        Method::Clflush
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Method::Clflush
    }
}

/// Write back the cache lines covering `[addr, addr+len)` and fence.
///
/// # Safety
/// `addr` must point to `len` mapped, accessible bytes.
pub unsafe fn persist(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let method = *METHOD.get_or_init(detect);
    let start = (addr as usize) & !(CACHE_LINE - 1);
    let end = addr as usize + len;
    let mut line = start;
    #[cfg(target_arch = "x86_64")]
    while line < end {
        let p = line as *const u8;
        match method {
            Method::Clwb => std::arch::asm!("clwb [{p}]", p = in(reg) p, options(nostack)),
            Method::ClflushOpt => {
                std::arch::asm!("clflushopt [{p}]", p = in(reg) p, options(nostack))
            }
            Method::Clflush => std::arch::asm!("clflush [{p}]", p = in(reg) p, options(nostack)),
        }
        line += CACHE_LINE;
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (method, line, end);
    }
    #[cfg(target_arch = "x86_64")]
    std::arch::asm!("sfence", options(nostack));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_does_not_corrupt() {
        let mut buf = vec![7u8; 256];
        unsafe { persist(buf.as_ptr(), buf.len()) };
        assert!(buf.iter().all(|&b| b == 7));
        buf[0] = 1;
        unsafe { persist(buf.as_ptr(), 1) };
        assert_eq!(buf[0], 1);
    }
}
