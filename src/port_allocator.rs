use crate::errors::{DaemonError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Issues unique ports from a fixed inclusive range for per-context services.
///
/// Allocation scans round-robin from the port after the last allocation and
/// wraps at the range end, so a freshly released port is not handed out again
/// until the rest of the range has been tried.
pub struct PortAllocator {
    start: u16,
    end: u16,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    allocated: BTreeSet<u16>,
    /// Next port to try.
    cursor: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || end == 0 {
            return Err(DaemonError::Validation(format!(
                "Port range {}-{} must be within 1-65535",
                start, end
            )));
        }
        if start > end {
            return Err(DaemonError::Validation(format!(
                "Invalid port range: start {} is greater than end {}",
                start, end
            )));
        }

        Ok(Self {
            start,
            end,
            state: Mutex::new(AllocatorState {
                allocated: BTreeSet::new(),
                cursor: start,
            }),
        })
    }

    pub fn allocate_port(&self) -> Result<u16> {
        let mut state = self.state.lock();
        let total = self.total_ports();

        if state.allocated.len() >= total {
            warn!("Port pool exhausted ({}-{})", self.start, self.end);
            return Err(DaemonError::PoolExhausted {
                start: self.start,
                end: self.end,
            });
        }

        let mut candidate = state.cursor;
        for _ in 0..total {
            if !state.allocated.contains(&candidate) {
                state.allocated.insert(candidate);
                state.cursor = self.next_after(candidate);
                debug!("Allocated port {} ({} in use)", candidate, state.allocated.len());
                return Ok(candidate);
            }
            candidate = self.next_after(candidate);
        }

        // allocated.len() < total guarantees a free slot above
        Err(DaemonError::PoolExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Returns `false` if the port was not allocated.
    pub fn release_port(&self, port: u16) -> bool {
        let mut state = self.state.lock();
        let released = state.allocated.remove(&port);
        if released {
            debug!("Released port {} ({} in use)", port, state.allocated.len());
        } else {
            debug!("Ignoring release of unallocated port {}", port);
        }
        released
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.state.lock().allocated.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub fn available_count(&self) -> usize {
        self.total_ports() - self.allocated_count()
    }

    pub fn total_ports(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Sorted snapshot of every allocated port.
    pub fn allocated_ports(&self) -> Vec<u16> {
        self.state.lock().allocated.iter().copied().collect()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn next_after(&self, port: u16) -> u16 {
        if port >= self.end {
            self.start
        } else {
            port + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_invalid_ranges() {
        assert!(PortAllocator::new(9000, 8000).is_err());
        assert!(PortAllocator::new(0, 10).is_err());
        assert!(PortAllocator::new(65535, 65535).is_ok());
    }

    #[test]
    fn test_round_robin_allocation() {
        let allocator = PortAllocator::new(8000, 8002).unwrap();
        assert_eq!(allocator.allocate_port().unwrap(), 8000);
        assert_eq!(allocator.allocate_port().unwrap(), 8001);

        // Released port is skipped until the scan wraps around to it
        assert!(allocator.release_port(8000));
        assert_eq!(allocator.allocate_port().unwrap(), 8002);
        assert_eq!(allocator.allocate_port().unwrap(), 8000);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new(8000, 8001).unwrap();
        allocator.allocate_port().unwrap();
        allocator.allocate_port().unwrap();
        let err = allocator.allocate_port().unwrap_err();
        assert!(matches!(err, DaemonError::PoolExhausted { start: 8000, end: 8001 }));
    }

    #[test]
    fn test_release_unallocated_is_noop() {
        let allocator = PortAllocator::new(8000, 8005).unwrap();
        assert!(!allocator.release_port(8003));
        let port = allocator.allocate_port().unwrap();
        assert!(allocator.release_port(port));
        assert!(!allocator.release_port(port));
    }

    #[test]
    fn test_wraps_at_range_end() {
        let allocator = PortAllocator::new(65534, 65535).unwrap();
        assert_eq!(allocator.allocate_port().unwrap(), 65534);
        assert_eq!(allocator.allocate_port().unwrap(), 65535);
        allocator.release_port(65534);
        assert_eq!(allocator.allocate_port().unwrap(), 65534);
    }

    #[test]
    fn test_counts_always_sum_to_total() {
        let allocator = PortAllocator::new(7000, 7009).unwrap();
        let mut held: Vec<u16> = Vec::new();
        // Deterministic pseudo-random interleaving of allocate/release
        let mut seed: u32 = 17;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if seed % 3 == 0 && !held.is_empty() {
                let idx = (seed as usize / 3) % held.len();
                let port = held.swap_remove(idx);
                assert!(allocator.release_port(port));
            } else if let Ok(port) = allocator.allocate_port() {
                assert!(!held.contains(&port), "port {} handed out twice", port);
                held.push(port);
            } else {
                assert_eq!(held.len(), 10);
            }
            assert_eq!(
                allocator.allocated_count() + allocator.available_count(),
                allocator.total_ports()
            );
        }

        let snapshot: HashSet<u16> = allocator.allocated_ports().into_iter().collect();
        let expected: HashSet<u16> = held.into_iter().collect();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        use std::sync::Arc;

        let allocator = Arc::new(PortAllocator::new(9000, 9099).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate_port().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(all.insert(port));
            }
        }
        assert_eq!(all.len(), 100);
        assert_eq!(allocator.available_count(), 0);
    }
}
