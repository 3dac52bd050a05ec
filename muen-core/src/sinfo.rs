//! Subject information (sinfo) directory.
//!
//! The hypervisor places a read-only, page-aligned directory of typed
//! resources at a well-known physical address before the subject starts.
//! This module parses that directory once at boot into owned, indexable
//! Rust values; afterwards it never changes.
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;

use crate::error::{MuenError, ResultExt, TypedResult};

/// `MUEN_SUBJECT_INFO_MAGIC`.
pub const SINFO_MAGIC: u64 = 0x03006f666e69756d;
/// Upper bound on the number of resource records in one directory.
pub const MAX_RESOURCE_COUNT: usize = 255;
/// Maximum length of a resource or subject name, not counting the
/// terminating NUL.
pub const MAX_NAME_LENGTH: usize = 63;
/// Length of the optional content hash carried by a memory region.
pub const HASH_LENGTH: usize = 32;

/// Memory region is writable by this subject.
pub const MEM_WRITABLE_FLAG: u8 = 0x01;
/// Memory region is executable by this subject.
pub const MEM_EXECUTABLE_FLAG: u8 = 0x02;
/// Device resource has at least one MSI-capable interrupt.
pub const DEV_MSI_FLAG: u8 = 0x01;

#[repr(C)]
#[derive(Clone, Copy)]
struct NameTypeRaw {
    length: u8,
    data: [u8; MAX_NAME_LENGTH],
    null_term: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MemRegionRaw {
    kind: u8,
    content: u8,
    flags: u8,
    pattern: u8,
    address: u64,
    size: u64,
    hash: [u8; HASH_LENGTH],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DeviceRaw {
    sid: u16,
    irte_start: u8,
    irq_start: u8,
    ir_count: u8,
    flags: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DevMemRaw {
    flags: u8,
    address: u64,
    size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
union ResourceDataRaw {
    memory: MemRegionRaw,
    device: DeviceRaw,
    devmem: DevMemRaw,
    number: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceRaw {
    kind: u8,
    name: NameTypeRaw,
    data: ResourceDataRaw,
}

#[repr(C)]
struct SubjectInfoRaw {
    magic: u64,
    tsc_khz: u64,
    name: NameTypeRaw,
    resource_count: u16,
    resources: [ResourceRaw; MAX_RESOURCE_COUNT],
}

fn decode_name(raw: &NameTypeRaw) -> String {
    let len = (raw.length as usize).min(MAX_NAME_LENGTH);
    String::from_utf8_lossy(&raw.data[..len]).into_owned()
}

/// A memory region resource: a physical address range plus access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Subject,
    SubjectChannel,
    SubjectState,
    SubjectInterrupts,
    SubjectSinfo,
    SubjectTimedEvent,
    SubjectBios,
    SubjectAcpiRsdp,
    SubjectZeroPage,
    SubjectInitrd,
    SubjectCmdline,
    SubjectFramebuffer,
    Unknown(u8),
}

impl From<u8> for MemoryKind {
    fn from(v: u8) -> Self {
        match v {
            1 => MemoryKind::Subject,
            2 => MemoryKind::SubjectChannel,
            3 => MemoryKind::SubjectState,
            4 => MemoryKind::SubjectInterrupts,
            5 => MemoryKind::SubjectSinfo,
            6 => MemoryKind::SubjectTimedEvent,
            7 => MemoryKind::SubjectBios,
            8 => MemoryKind::SubjectAcpiRsdp,
            9 => MemoryKind::SubjectZeroPage,
            10 => MemoryKind::SubjectInitrd,
            11 => MemoryKind::SubjectCmdline,
            12 => MemoryKind::SubjectFramebuffer,
            other => MemoryKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Uninitialized,
    Fill,
    File,
    Unknown(u8),
}

impl From<u8> for ContentKind {
    fn from(v: u8) -> Self {
        match v {
            0 => ContentKind::Uninitialized,
            1 => ContentKind::Fill,
            2 => ContentKind::File,
            other => ContentKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub content: ContentKind,
    pub flags: u8,
    pub pattern: u8,
    pub address: u64,
    pub size: u64,
    pub hash: Option<[u8; HASH_LENGTH]>,
}

impl MemoryRegion {
    pub fn writable(&self) -> bool {
        self.flags & MEM_WRITABLE_FLAG != 0
    }

    pub fn executable(&self) -> bool {
        self.flags & MEM_EXECUTABLE_FLAG != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceResource {
    pub sid: u16,
    pub irte_start: u8,
    pub irq_start: u8,
    pub ir_count: u8,
    pub msi: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DevMemResource {
    pub address: u64,
    pub size: u64,
    pub writable: bool,
}

/// Tagged union over a sinfo record's payload, replacing the C union +
/// kind byte. `kind()` gives the `ResourceKindTag` used for lookups.
#[derive(Debug, Clone, Copy)]
pub enum Resource {
    None,
    Memory(MemoryRegion),
    Event(u8),
    Vector(u8),
    Device(DeviceResource),
    DevMem(DevMemResource),
}

/// Discriminant-only view of [`Resource`], used to query the directory
/// by kind without constructing a full record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKindTag {
    None,
    Memory,
    Event,
    Vector,
    Device,
    DevMem,
}

impl Resource {
    pub fn kind(&self) -> ResourceKindTag {
        match self {
            Resource::None => ResourceKindTag::None,
            Resource::Memory(_) => ResourceKindTag::Memory,
            Resource::Event(_) => ResourceKindTag::Event,
            Resource::Vector(_) => ResourceKindTag::Vector,
            Resource::Device(_) => ResourceKindTag::Device,
            Resource::DevMem(_) => ResourceKindTag::DevMem,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryRegion> {
        match self {
            Resource::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<&DeviceResource> {
        match self {
            Resource::Device(d) => Some(d),
            _ => None,
        }
    }
}

/// One named entry in the sinfo directory.
#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub resource: Resource,
}

fn decode_resource(raw: &ResourceRaw) -> Option<Resource> {
    // Safety: `data` is read only through the union member that matches
    // `kind`, mirroring the C union + kind-byte decode in muen-sinfo.c.
    unsafe {
        match raw.kind {
            0 => Some(Resource::None),
            1 => {
                let m = raw.data.memory;
                Some(Resource::Memory(MemoryRegion {
                    kind: MemoryKind::from(m.kind),
                    content: ContentKind::from(m.content),
                    flags: m.flags,
                    pattern: m.pattern,
                    address: m.address,
                    size: m.size,
                    hash: (m.content == 2 /* File */).then_some(m.hash),
                }))
            }
            2 => Some(Resource::Event(raw.data.number)),
            3 => Some(Resource::Vector(raw.data.number)),
            4 => {
                let d = raw.data.device;
                Some(Resource::Device(DeviceResource {
                    sid: d.sid,
                    irte_start: d.irte_start,
                    irq_start: d.irq_start,
                    ir_count: d.ir_count,
                    msi: d.flags & DEV_MSI_FLAG != 0,
                }))
            }
            5 => {
                let dm = raw.data.devmem;
                Some(Resource::DevMem(DevMemResource {
                    address: dm.address,
                    size: dm.size,
                    writable: dm.flags & MEM_WRITABLE_FLAG != 0,
                }))
            }
            unknown => {
                log::warn!("sinfo: skipping record of unknown kind {unknown}");
                None
            }
        }
    }
}

/// Parsed, owned view of the subject information directory.
#[derive(Debug)]
pub struct Sinfo {
    subject_name: String,
    tsc_khz: u64,
    records: Vec<Record>,
}

impl Sinfo {
    /// Parses a sinfo page mapped read-only at `bytes`.
    ///
    /// Returns [`MuenError::SinfoBadMagic`] if the magic does not match;
    /// every other dependent lookup in the core relies on this check
    /// having already succeeded.
    pub fn parse(bytes: &[u8]) -> TypedResult<Self> {
        if bytes.len() < size_of::<SubjectInfoRaw>() {
            return Err(anyhow!(
                "sinfo region too small: {} bytes, need {}",
                bytes.len(),
                size_of::<SubjectInfoRaw>()
            ))
            .typ(MuenError::SinfoBadMagic);
        }
        // Safety: size was just checked; the page is hypervisor-owned and
        // read-only for the lifetime of the partition.
        let raw = unsafe { &*(bytes.as_ptr() as *const SubjectInfoRaw) };

        if raw.magic != SINFO_MAGIC {
            return Err(anyhow!(
                "bad sinfo magic: {:#x}, expected {:#x}",
                raw.magic,
                SINFO_MAGIC
            ))
            .typ(MuenError::SinfoBadMagic);
        }

        let resource_count = (raw.resource_count as usize).min(MAX_RESOURCE_COUNT);
        let mut records = Vec::with_capacity(resource_count);
        for entry in &raw.resources[..resource_count] {
            if let Some(resource) = decode_resource(entry) {
                records.push(Record {
                    name: decode_name(&entry.name),
                    resource,
                });
            }
        }

        Ok(Self {
            subject_name: decode_name(&raw.name),
            tsc_khz: raw.tsc_khz,
            records,
        })
    }

    /// True iff the directory's magic matched on parse. Always `true` for
    /// a successfully-constructed `Sinfo` — kept for parity with the
    /// original contract, which checks the magic before trusting anything
    /// else in the page.
    pub fn check_magic(&self) -> bool {
        true
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    pub fn tsc_khz(&self) -> u64 {
        self.tsc_khz
    }

    /// First record whose name and kind both match.
    pub fn get_resource(&self, name: &str, kind: ResourceKindTag) -> Option<&Record> {
        self.iter().find(|r| r.name == name && r.resource.kind() == kind)
    }

    /// Device record by PCI source-ID.
    pub fn get_device(&self, sid: u16) -> Option<&DeviceResource> {
        self.iter().find_map(|r| {
            let dev = r.resource.as_device()?;
            (dev.sid == sid).then_some(dev)
        })
    }

    /// Iterates records in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Visitor-style enumeration kept for parity with
    /// `muen_for_each_resource`; prefer [`Sinfo::iter`] in new code.
    pub fn for_each<F: FnMut(&Record) -> bool>(&self, mut visitor: F) {
        for record in self.iter() {
            if !visitor(record) {
                break;
            }
        }
    }

    /// Logs every record at `info` level, one line per record, mirroring
    /// the boot-time resource dump in `muen-sinfo.c`'s `log_resource`.
    pub fn log_resources(&self) {
        for record in self.iter() {
            match &record.resource {
                Resource::None => log::info!("{}: none", record.name),
                Resource::Memory(m) => log::info!(
                    "{}: memory kind={:?} addr={:#x} size={:#x} writable={} executable={}",
                    record.name,
                    m.kind,
                    m.address,
                    m.size,
                    m.writable(),
                    m.executable()
                ),
                Resource::Event(n) => log::info!("{}: event {n}", record.name),
                Resource::Vector(n) => log::info!("{}: vector {n}", record.name),
                Resource::Device(d) => log::info!(
                    "{}: device sid={:#x} irte_start={} irq_start={} ir_count={} msi={}",
                    record.name,
                    d.sid,
                    d.irte_start,
                    d.irq_start,
                    d.ir_count,
                    d.msi
                ),
                Resource::DevMem(dm) => log::info!(
                    "{}: devmem addr={:#x} size={:#x} writable={}",
                    record.name,
                    dm.address,
                    dm.size,
                    dm.writable
                ),
            }
        }
    }
}

/// A per-CPU scheduling information page maintained by the hypervisor
/// alongside sinfo. Updated concurrently, hence the acquire loads.
#[repr(C)]
pub struct SchedulingInfo {
    tsc_schedule_start: AtomicU64,
    tsc_schedule_end: AtomicU64,
}

impl SchedulingInfo {
    /// Borrows a scheduling info page mapped read-only at `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> TypedResult<&SchedulingInfo> {
        if bytes.len() < size_of::<SchedulingInfo>() {
            return Err(anyhow!("scheduling info region too small")).typ(MuenError::RegionTooSmall);
        }
        Ok(unsafe { &*(bytes.as_ptr() as *const SchedulingInfo) })
    }

    pub fn sched_start(&self) -> u64 {
        self.tsc_schedule_start.load(Ordering::Acquire)
    }

    pub fn sched_end(&self) -> u64 {
        self.tsc_schedule_end.load(Ordering::Acquire)
    }
}

/// Test-only helpers for building synthetic sinfo pages, shared with
/// `affinity`'s tests so neither module has to re-derive the byte layout.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A resource's payload, expressed without needing to name the
    /// private raw union type.
    #[derive(Clone, Copy)]
    pub enum RawData {
        Number(u8),
        Memory {
            kind: u8,
            flags: u8,
            address: u64,
            size: u64,
        },
    }

    fn raw_name(s: &str) -> NameTypeRaw {
        let mut data = [0u8; MAX_NAME_LENGTH];
        data[..s.len()].copy_from_slice(s.as_bytes());
        NameTypeRaw {
            length: s.len() as u8,
            data,
            null_term: 0,
        }
    }

    pub fn build_page(name: &str, tsc_khz: u64, resources: &[(&str, u8, RawData)]) -> Vec<u8> {
        let mut raw = unsafe { std::mem::zeroed::<SubjectInfoRaw>() };
        raw.magic = SINFO_MAGIC;
        raw.tsc_khz = tsc_khz;
        raw.name = raw_name(name);
        raw.resource_count = resources.len() as u16;
        for (i, (rname, kind, data)) in resources.iter().enumerate() {
            let data = match *data {
                RawData::Number(n) => ResourceDataRaw { number: n },
                RawData::Memory {
                    kind,
                    flags,
                    address,
                    size,
                } => ResourceDataRaw {
                    memory: MemRegionRaw {
                        kind,
                        content: 0,
                        flags,
                        pattern: 0,
                        address,
                        size,
                        hash: [0; HASH_LENGTH],
                    },
                },
            };
            raw.resources[i] = ResourceRaw {
                kind: *kind,
                name: raw_name(rname),
                data,
            };
        }
        let ptr = &raw as *const SubjectInfoRaw as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size_of::<SubjectInfoRaw>()) }.to_vec()
    }

    pub fn build_sinfo(name: &str, tsc_khz: u64, resources: &[(&str, u8, RawData)]) -> Sinfo {
        Sinfo::parse(&build_page(name, tsc_khz, resources)).unwrap()
    }

    pub fn empty_page() -> Vec<u8> {
        build_page("p", 0, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{build_page, RawData};
    use super::*;

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = build_page("x", 0, &[]);
        bytes[0] = 0xff;
        let err = Sinfo::parse(&bytes).unwrap_err();
        assert!(matches!(err.err(), MuenError::SinfoBadMagic));
    }

    #[test]
    fn parses_memory_and_event_records() {
        let bytes = build_page(
            "partition1",
            1_000_000,
            &[
                (
                    "channel_out",
                    1,
                    RawData::Memory {
                        kind: 2, // SubjectChannel
                        flags: MEM_WRITABLE_FLAG,
                        address: 0x1000,
                        size: 0x2000,
                    },
                ),
                ("channel_out.event", 2, RawData::Number(7)),
            ],
        );
        let sinfo = Sinfo::parse(&bytes).unwrap();
        assert_eq!(sinfo.subject_name(), "partition1");
        assert_eq!(sinfo.tsc_khz(), 1_000_000);

        let r = sinfo
            .get_resource("channel_out", ResourceKindTag::Memory)
            .unwrap();
        let region = r.resource.as_memory().unwrap();
        assert_eq!(region.address, 0x1000);
        assert!(region.writable());

        let evt = sinfo
            .get_resource("channel_out.event", ResourceKindTag::Event)
            .unwrap();
        assert!(matches!(evt.resource, Resource::Event(7)));
    }

    #[test]
    fn unknown_kind_is_skipped_not_faulted() {
        let bytes = build_page("x", 0, &[("weird", 200, RawData::Number(0))]);
        let sinfo = Sinfo::parse(&bytes).unwrap();
        assert_eq!(sinfo.iter().count(), 0);
    }

    #[test]
    fn for_each_stops_when_visitor_returns_false() {
        let bytes = build_page(
            "x",
            0,
            &[
                ("a", 2, RawData::Number(1)),
                ("b", 2, RawData::Number(2)),
                ("c", 2, RawData::Number(3)),
            ],
        );
        let sinfo = Sinfo::parse(&bytes).unwrap();
        let mut seen = Vec::new();
        sinfo.for_each(|r| {
            seen.push(r.name.clone());
            r.name != "b"
        });
        assert_eq!(seen, vec!["a", "b"]);
    }

    /// Smoke test: `log_resources` must not panic over one record of
    /// every kind, including an unknown one that was already skipped at
    /// parse time.
    #[test]
    fn log_resources_handles_every_kind_without_panicking() {
        let bytes = build_page(
            "partition1",
            2_000_000,
            &[
                (
                    "channel_out",
                    1,
                    RawData::Memory {
                        kind: 2,
                        flags: MEM_WRITABLE_FLAG,
                        address: 0x1000,
                        size: 0x2000,
                    },
                ),
                ("channel_out.event", 2, RawData::Number(7)),
                ("irq.vector", 3, RawData::Number(32)),
                ("weird", 200, RawData::Number(0)),
            ],
        );
        let sinfo = Sinfo::parse(&bytes).unwrap();
        sinfo.log_resources();
        assert_eq!(sinfo.iter().count(), 3);
    }
}
