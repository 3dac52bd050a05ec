//! Process-wide bundle of the boot-time, read-only resources every other
//! driver depends on (§9 "Global mutable state"): the sinfo directory, the
//! frozen affinity registry, and one scheduling-info page per CPU. A
//! `Platform` is constructed once during early boot and handed out by
//! shared reference from then on; nothing about it changes afterwards.
use std::collections::HashMap;

use crate::affinity::{AffinityRegistry, EventTrigger};
use crate::sinfo::{Sinfo, SchedulingInfo};

/// Boot-time resources, bundled so callers thread one value instead of
/// three. Per-CPU scheduling pages live in a `cpu_id → page` map keyed by
/// integer index rather than thread-local storage, since the reader of a
/// given CPU's page is not necessarily the thread pinned to that CPU.
pub struct Platform<'a, T: EventTrigger> {
    sinfo: Sinfo,
    affinity: AffinityRegistry<T>,
    scheduling: HashMap<u32, &'a SchedulingInfo>,
}

impl<'a, T: EventTrigger> Platform<'a, T> {
    pub fn new(
        sinfo: Sinfo,
        affinity: AffinityRegistry<T>,
        scheduling: HashMap<u32, &'a SchedulingInfo>,
    ) -> Self {
        Self {
            sinfo,
            affinity,
            scheduling,
        }
    }

    pub fn sinfo(&self) -> &Sinfo {
        &self.sinfo
    }

    pub fn affinity(&self) -> &AffinityRegistry<T> {
        &self.affinity
    }

    pub fn tsc_khz(&self) -> u64 {
        self.sinfo.tsc_khz()
    }

    pub fn sched_start(&self, cpu: u32) -> Option<u64> {
        self.scheduling.get(&cpu).map(|p| p.sched_start())
    }

    pub fn sched_end(&self, cpu: u32) -> Option<u64> {
        self.scheduling.get(&cpu).map(|p| p.sched_end())
    }
}

#[cfg(target_arch = "x86_64")]
static PLATFORM: once_cell::sync::OnceCell<Platform<'static, crate::affinity::HypercallTrigger>> =
    once_cell::sync::OnceCell::new();

#[cfg(target_arch = "x86_64")]
impl Platform<'static, crate::affinity::HypercallTrigger> {
    /// Installs the process-wide platform. Intended to be called exactly
    /// once, during early boot; returns `self` back on a second call.
    pub fn install(self) -> Result<(), Self> {
        PLATFORM.set(self)
    }

    /// Borrows the process-wide platform installed by [`Platform::install`].
    ///
    /// # Panics
    /// If `install` has not yet been called.
    pub fn global() -> &'static Self {
        PLATFORM.get().expect("Platform::install was not called during boot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::RecordingTrigger;
    use crate::sinfo::test_support::{build_sinfo, RawData};

    #[test]
    fn bundles_sinfo_affinity_and_scheduling() {
        let sinfo = build_sinfo("p", 1_000, &[("net.event", 2, RawData::Number(3))]);
        let affinity = AffinityRegistry::build([(0, &sinfo)], RecordingTrigger::new(0));
        let platform = Platform::new(sinfo, affinity, HashMap::new());

        assert_eq!(platform.tsc_khz(), 1_000);
        assert!(platform.affinity().one_match("net.event", crate::sinfo::ResourceKindTag::Event).is_some());
        assert_eq!(platform.sched_start(0), None);
    }
}
