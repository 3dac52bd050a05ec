//! Resource-to-CPU affinity registry.
//!
//! Built once during early boot by walking sinfo on every CPU; frozen
//! for reads afterwards (RCU-style: readers only ever see a fully-built
//! list, never a partially-constructed one).
use std::sync::Mutex;

use crate::sinfo::{Resource, ResourceKindTag, Sinfo};

/// `{cpu, resource}` binding of an event, vector or passthrough device
/// to the CPU that owns it.
#[derive(Debug, Clone)]
pub struct AffinityEntry {
    pub cpu: u32,
    pub name: String,
    pub resource: Resource,
}

impl AffinityEntry {
    pub fn kind(&self) -> ResourceKindTag {
        self.resource.kind()
    }
}

/// Issues the event-trigger hypercall. Implementations are expected to
/// know the CPU they are currently executing on; cross-CPU dispatch
/// (the IPI-equivalent) is likewise implementation-defined, since SMP
/// bring-up itself is out of scope for this crate.
pub trait EventTrigger: Send + Sync {
    /// The CPU this call is currently executing on.
    fn current_cpu(&self) -> u32;
    /// Issues the hypercall for `event_id` on the calling CPU.
    fn hypercall(&self, event_id: u8);
    /// Dispatches the hypercall for `event_id` to run on `cpu`
    /// (IPI-equivalent), returning once it has been issued there.
    fn hypercall_on(&self, cpu: u32, event_id: u8);
}

/// `EventTrigger` backed by the real `vmcall`-style hypercall. Always
/// reports itself as owning CPU 0, since this crate carries no SMP
/// bring-up; embedders that run on more than one CPU supply their own
/// `EventTrigger` wrapping the same instruction with real topology
/// information.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default)]
pub struct HypercallTrigger;

#[cfg(target_arch = "x86_64")]
impl EventTrigger for HypercallTrigger {
    fn current_cpu(&self) -> u32 {
        0
    }

    fn hypercall(&self, event_id: u8) {
        // Safety: issuing a Muen hypercall is only valid when running as
        // a subject under the separation kernel; `event_id` is the sole
        // argument, there is no return value.
        unsafe {
            std::arch::asm!(
                "vmcall",
                in("rax") event_id as u64,
                options(nomem, nostack, preserves_flags),
            );
        }
    }

    fn hypercall_on(&self, _cpu: u32, event_id: u8) {
        // Real cross-CPU dispatch is an IPI followed by a local vmcall on
        // the target CPU; that plumbing is SMP bring-up and out of scope
        // here, so we fall back to issuing it locally.
        self.hypercall(event_id);
    }
}

/// Test/host double recording every call instead of trapping to a
/// hypervisor. Lets the registry's dispatch logic be exercised off real
/// Muen hardware.
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    cpu: u32,
    calls: Mutex<Vec<(u32, u8)>>,
}

impl RecordingTrigger {
    pub fn new(cpu: u32) -> Self {
        Self {
            cpu,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(u32, u8)> {
        self.calls.lock().unwrap().clone()
    }
}

impl EventTrigger for RecordingTrigger {
    fn current_cpu(&self) -> u32 {
        self.cpu
    }

    fn hypercall(&self, event_id: u8) {
        self.calls.lock().unwrap().push((self.cpu, event_id));
    }

    fn hypercall_on(&self, cpu: u32, event_id: u8) {
        self.calls.lock().unwrap().push((cpu, event_id));
    }
}

/// Frozen, process-wide view of resource-to-CPU bindings.
pub struct AffinityRegistry<T: EventTrigger> {
    entries: Vec<AffinityEntry>,
    trigger: T,
}

impl<T: EventTrigger> AffinityRegistry<T> {
    /// Walks `sinfos` (one entry per CPU) and records an affinity for
    /// every event, vector, and device with `ir_count > 0`.
    pub fn build<'a>(sinfos: impl IntoIterator<Item = (u32, &'a Sinfo)>, trigger: T) -> Self {
        let mut entries = Vec::new();
        for (cpu, sinfo) in sinfos {
            for record in sinfo.iter() {
                let include = match &record.resource {
                    Resource::Event(_) | Resource::Vector(_) => true,
                    Resource::Device(d) => d.ir_count > 0,
                    _ => false,
                };
                if include {
                    entries.push(AffinityEntry {
                        cpu,
                        name: record.name.clone(),
                        resource: record.resource,
                    });
                }
            }
        }
        Self { entries, trigger }
    }

    /// Copies out every entry for which `predicate` is true.
    pub fn get_res_affinity<F: Fn(&AffinityEntry) -> bool>(&self, predicate: F) -> Vec<AffinityEntry> {
        self.entries.iter().filter(|e| predicate(e)).cloned().collect()
    }

    /// Asserts the `(name, kind)` predicate matches exactly one entry;
    /// returns `None` on zero or more than one match (logged as a
    /// warning in the ambiguous case, since the hypervisor's static
    /// policy is supposed to make this impossible).
    pub fn one_match(&self, name: &str, kind: ResourceKindTag) -> Option<AffinityEntry> {
        let mut matches = self
            .entries
            .iter()
            .filter(|e| e.name == name && e.kind() == kind);
        let first = matches.next()?.clone();
        if matches.next().is_some() {
            log::warn!("affinity: ambiguous match for {name} ({kind:?})");
            return None;
        }
        Some(first)
    }

    /// Triggers `event_id`. Issues the hypercall directly if `cpu` is the
    /// calling CPU, otherwise dispatches to `cpu` first.
    pub fn trigger_event(&self, event_id: u8, cpu: u32) {
        if cpu == self.trigger.current_cpu() {
            self.trigger.hypercall(event_id);
        } else {
            self.trigger.hypercall_on(cpu, event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinfo::{ResourceKindTag, Sinfo};

    fn sinfo_with(name: &str, tsc_khz: u64, resources: &[(&str, u8, crate::sinfo::test_support::RawData)]) -> Sinfo {
        crate::sinfo::test_support::build_sinfo(name, tsc_khz, resources)
    }

    #[test]
    fn one_match_finds_unique_event() {
        let sinfo = sinfo_with(
            "p",
            0,
            &[("net.event", 2, crate::sinfo::test_support::RawData::Number(5))],
        );
        let registry = AffinityRegistry::build([(0, &sinfo)], RecordingTrigger::new(0));
        let entry = registry.one_match("net.event", ResourceKindTag::Event).unwrap();
        assert_eq!(entry.cpu, 0);
        assert!(matches!(entry.resource, Resource::Event(5)));
    }

    #[test]
    fn one_match_rejects_ambiguous() {
        let sinfo = sinfo_with(
            "p",
            0,
            &[
                ("net.event", 2, crate::sinfo::test_support::RawData::Number(5)),
            ],
        );
        let registry = AffinityRegistry::build(
            [(0, &sinfo), (1, &sinfo)],
            RecordingTrigger::new(0),
        );
        assert!(registry
            .one_match("net.event", ResourceKindTag::Event)
            .is_none());
    }

    #[test]
    fn trigger_event_dispatches_locally_or_remotely() {
        let trigger = RecordingTrigger::new(0);
        let sinfo = Sinfo::parse(&crate::sinfo::test_support::empty_page()).unwrap();
        let registry = AffinityRegistry::build([(0, &sinfo)], trigger);
        registry.trigger_event(3, 0);
        registry.trigger_event(4, 1);
        assert_eq!(registry.trigger.calls(), vec![(0, 3), (1, 4)]);
    }
}
