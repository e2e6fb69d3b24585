use std::{collections::BTreeSet, net::TcpListener, sync::Mutex};

use tracing::debug;

use crate::config::checked_port_range;
use crate::error::{Error, Result};

/// OS-level availability check on all interfaces.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(_) => false,
    }
}

fn loopback_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[derive(Debug)]
struct AllocState {
    allocated: BTreeSet<u16>,
    // u32 so the cursor can step past 65535 without wrapping the type.
    next: u32,
}

/// Hands out worker ports from an inclusive range.
///
/// A port is handed out only when it is not already claimed through this
/// allocator and a bind-and-release check succeeds.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    is_free: fn(u16) -> bool,
    state: Mutex<AllocState>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self::with_free_check(start, end, loopback_port_free)
    }

    pub(crate) fn with_free_check(start: u16, end: u16, is_free: fn(u16) -> bool) -> Self {
        let (start, end) = checked_port_range(start, end);
        Self {
            start,
            end,
            is_free,
            state: Mutex::new(AllocState {
                allocated: BTreeSet::new(),
                next: u32::from(start),
            }),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let span = u32::from(self.end) - u32::from(self.start) + 1;

        for _ in 0..span {
            let mut candidate = state.next;
            if candidate > u32::from(self.end) || candidate < u32::from(self.start) {
                candidate = u32::from(self.start);
            }
            state.next = candidate + 1;

            let Ok(port) = u16::try_from(candidate) else {
                continue;
            };
            if state.allocated.contains(&port) {
                continue;
            }
            if (self.is_free)(port) {
                state.allocated.insert(port);
                debug!(port, "allocated port");
                return Ok(port);
            }
        }

        Err(Error::conflict(format!(
            "no available ports in range {}-{}",
            self.start, self.end
        )))
    }

    /// Records an explicitly requested port so `allocate` skips it.
    /// Returns false when it was already claimed.
    pub fn claim(&self, port: u16) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.allocated.insert(port)
    }

    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.allocated.remove(&port) {
            debug!(port, "released port");
        }
        if (self.start..=self.end).contains(&port) {
            state.next = u32::from(port);
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.allocated.contains(&port)
    }

    pub fn allocated_ports(&self) -> Vec<u16> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.allocated.iter().copied().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn always_free(_: u16) -> bool {
        true
    }

    fn odd_only(port: u16) -> bool {
        port % 2 == 1
    }

    #[test]
    fn exhausts_after_full_range() {
        let alloc = PortAllocator::with_free_check(20000, 20002, always_free);
        let mut got = vec![
            alloc.allocate().unwrap(),
            alloc.allocate().unwrap(),
            alloc.allocate().unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![20000, 20001, 20002]);

        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("20000-20002"));
    }

    #[test]
    fn release_makes_port_immediately_reusable() {
        let alloc = PortAllocator::with_free_check(20000, 20009, always_free);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);

        alloc.release(a);
        assert!(!alloc.is_allocated(a));
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn cursor_rotates_instead_of_retrying_low_port() {
        let alloc = PortAllocator::with_free_check(20000, 20009, always_free);
        assert_eq!(alloc.allocate().unwrap(), 20000);
        assert_eq!(alloc.allocate().unwrap(), 20001);
        assert_eq!(alloc.allocate().unwrap(), 20002);
    }

    #[test]
    fn skips_ports_failing_os_bind_check() {
        let alloc = PortAllocator::with_free_check(20000, 20005, odd_only);
        assert_eq!(alloc.allocate().unwrap(), 20001);
        assert_eq!(alloc.allocate().unwrap(), 20003);
        assert_eq!(alloc.allocate().unwrap(), 20005);
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn claimed_ports_are_skipped() {
        let alloc = PortAllocator::with_free_check(20000, 20001, always_free);
        assert!(alloc.claim(20000));
        assert!(!alloc.claim(20000));
        assert_eq!(alloc.allocate().unwrap(), 20001);
        assert!(alloc.allocate().is_err());
        assert_eq!(alloc.allocated_ports(), vec![20000, 20001]);
    }

    #[test]
    fn real_bind_check_rejects_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        if port < 1024 {
            return;
        }
        let alloc = PortAllocator::new(port, port);
        assert!(alloc.allocate().is_err());
        assert!(!is_port_available(port));
        drop(listener);
    }

    #[test]
    fn invalid_range_uses_default() {
        let alloc = PortAllocator::new(9000, 10);
        assert_eq!(alloc.range(), (9868, 9968));
    }
}
