//! Child-device demultiplex and per-device statistics (component E,
//! control plane). Grounded on `add_child`/`del_child`/`add_mark`/
//! `del_mark` in `muennet_cfg.c`/`net.c`.
//!
//! The original keeps an owning array `children[1..=N]` of kernel `struct
//! net_device *` initialised to the parent itself. Modelled here (per the
//! design note on avoiding owning pointers) as an arena of integer
//! [`DeviceId`]s: marks resolve through a small table into the arena, and
//! an unbound mark resolves to [`ParentDevice::SELF`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Opaque handle into a [`ParentDevice`]'s child arena. `DeviceId(0)` is
/// reserved for the parent itself and is never allocated to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

/// `rx_packets, rx_bytes, rx_errors, rx_over_errors, rx_frame_errors,
/// tx_packets, tx_bytes, tx_dropped` from `muennet_stats()`.
#[derive(Debug, Default)]
pub struct Stats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    rx_over_errors: AtomicU64,
    rx_frame_errors: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
}

macro_rules! stat_accessor {
    ($field:ident, $inc:ident) => {
        pub fn $field(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        pub fn $inc(&self, by: u64) {
            self.$field.fetch_add(by, Ordering::Relaxed);
        }
    };
}

impl Stats {
    stat_accessor!(rx_packets, add_rx_packets);
    stat_accessor!(rx_bytes, add_rx_bytes);
    stat_accessor!(rx_errors, add_rx_errors);
    stat_accessor!(rx_over_errors, add_rx_over_errors);
    stat_accessor!(rx_frame_errors, add_rx_frame_errors);
    stat_accessor!(tx_packets, add_tx_packets);
    stat_accessor!(tx_bytes, add_tx_bytes);
    stat_accessor!(tx_dropped, add_tx_dropped);

    pub fn record_rx(&self, bytes: usize) {
        self.add_rx_packets(1);
        self.add_rx_bytes(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.add_tx_packets(1);
        self.add_tx_bytes(bytes as u64);
    }
}

/// A demultiplexed child network device.
#[derive(Debug)]
pub struct ChildDevice {
    pub name: String,
    pub stats: Stats,
}

impl ChildDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Stats::default(),
        }
    }
}

#[derive(Default)]
struct ChildTable {
    next_id: u32,
    devices: HashMap<DeviceId, ChildDevice>,
    marks: HashMap<u32, DeviceId>,
}

/// Owns the per-interface child arena and mark table behind a single lock,
/// matching the original's one spin-lock serialising framer transmit and
/// child-table mutation.
pub struct ParentDevice {
    stats: Stats,
    table: Mutex<ChildTable>,
}

impl ParentDevice {
    /// The reserved identity of the parent device itself, used as the
    /// fallback for any mark with no bound child.
    pub const SELF: DeviceId = DeviceId(0);

    pub fn new() -> Self {
        Self {
            stats: Stats::default(),
            table: Mutex::new(ChildTable::default()),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Allocates a new child device, returning its handle.
    pub fn attach_child(&self, name: impl Into<String>) -> DeviceId {
        let mut table = self.table.lock().unwrap();
        table.next_id += 1;
        let id = DeviceId(table.next_id);
        table.devices.insert(id, ChildDevice::new(name));
        id
    }

    /// Removes a child device and every mark still bound to it.
    pub fn detach_child(&self, id: DeviceId) {
        let mut table = self.table.lock().unwrap();
        table.devices.remove(&id);
        table.marks.retain(|_, bound| *bound != id);
    }

    /// Binds `mark` to `id`, replacing any prior binding for that mark.
    pub fn bind_mark(&self, id: DeviceId, mark: u32) -> Result<(), UnknownChild> {
        let mut table = self.table.lock().unwrap();
        if id != Self::SELF && !table.devices.contains_key(&id) {
            return Err(UnknownChild);
        }
        table.marks.insert(mark, id);
        Ok(())
    }

    /// Removes any binding for `mark`; it resolves back to the parent.
    pub fn unbind_mark(&self, mark: u32) {
        self.table.lock().unwrap().marks.remove(&mark);
    }

    /// Resolves `mark` to its bound child, or [`ParentDevice::SELF`].
    pub fn dispatch(&self, mark: u32) -> DeviceId {
        self.table
            .lock()
            .unwrap()
            .marks
            .get(&mark)
            .copied()
            .unwrap_or(Self::SELF)
    }

    /// Runs `f` against the child's stats, or the parent's own if `id` is
    /// [`ParentDevice::SELF`] or unknown.
    pub fn with_stats<R>(&self, id: DeviceId, f: impl FnOnce(&Stats) -> R) -> R {
        if id == Self::SELF {
            return f(&self.stats);
        }
        let table = self.table.lock().unwrap();
        match table.devices.get(&id) {
            Some(child) => f(&child.stats),
            None => f(&self.stats),
        }
    }

    pub fn child_name(&self, id: DeviceId) -> Option<String> {
        self.table.lock().unwrap().devices.get(&id).map(|c| c.name.clone())
    }
}

impl Default for ParentDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownChild;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_mark_resolves_to_parent() {
        let parent = ParentDevice::new();
        assert_eq!(parent.dispatch(5), ParentDevice::SELF);
    }

    #[test]
    fn attach_bind_dispatch_round_trip() {
        let parent = ParentDevice::new();
        let child = parent.attach_child("veth0");
        parent.bind_mark(child, 2).unwrap();
        assert_eq!(parent.dispatch(2), child);
        assert_eq!(parent.child_name(child).as_deref(), Some("veth0"));
    }

    #[test]
    fn detach_child_clears_its_marks() {
        let parent = ParentDevice::new();
        let child = parent.attach_child("veth0");
        parent.bind_mark(child, 2).unwrap();
        parent.detach_child(child);
        assert_eq!(parent.dispatch(2), ParentDevice::SELF);
    }

    #[test]
    fn unbind_mark_falls_back_to_parent() {
        let parent = ParentDevice::new();
        let child = parent.attach_child("veth0");
        parent.bind_mark(child, 2).unwrap();
        parent.unbind_mark(2);
        assert_eq!(parent.dispatch(2), ParentDevice::SELF);
    }

    #[test]
    fn bind_mark_rejects_unknown_child() {
        let parent = ParentDevice::new();
        let bogus = parent.attach_child("x");
        parent.detach_child(bogus);
        assert_eq!(parent.bind_mark(bogus, 1), Err(UnknownChild));
    }

    #[test]
    fn stats_record_rx_and_tx() {
        let stats = Stats::default();
        stats.record_rx(100);
        stats.record_tx(50);
        assert_eq!(stats.rx_packets(), 1);
        assert_eq!(stats.rx_bytes(), 100);
        assert_eq!(stats.tx_packets(), 1);
        assert_eq!(stats.tx_bytes(), 50);
    }
}
