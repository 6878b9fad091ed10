use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over an inclusive port range.
#[derive(Debug)]
pub struct PortRange {
    ports: Vec<u16>,
    next: AtomicUsize,
}

impl PortRange {
    /// `to < from` collapses to the single port `from`.
    pub fn new(from: u16, to: u16) -> Self {
        let ports = if to < from {
            vec![from]
        } else {
            (from..=to).collect()
        };
        Self {
            ports,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_port(&self) -> u16 {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.ports.len();
        self.ports[index]
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}
