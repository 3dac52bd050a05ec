//! Echoes every element read from one channel page onto another, off real
//! Muen hardware: both pages are ordinary memory-mapped files, useful for
//! exercising the writer/reader state machines against each other without
//! a hypervisor. Not a muennet framer demo — see the `muen-net` crate's
//! own tests for that; this is `muen-core`'s channel pair in isolation.
#[macro_use]
extern crate log;

use std::env;
use std::fs::OpenOptions;
use std::time::Duration;

use anyhow::{Context, Result};
use memmap2::MmapMut;
use muen_core::channel::Channel;
use muen_core::reader::{ReadResult, Reader};
use muen_core::writer::{fresh_epoch, Writer};

fn main() {
    pretty_env_logger::formatted_builder()
        .parse_filters(&env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .format_timestamp_secs()
        .init();

    if let Err(e) = run() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let usage = "usage: netchannel_echo <in-page-file> <out-page-file> <protocol> <element-size> [poll-ms]";

    let in_path = args.next().context(usage)?;
    let out_path = args.next().context(usage)?;
    let protocol: u64 = args.next().context(usage)?.parse().context("protocol")?;
    let element_size: u64 = args.next().context(usage)?.parse().context("element-size")?;
    let poll_ms: u64 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("poll-ms")?
        .unwrap_or(50);

    let in_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&in_path)
        .with_context(|| format!("opening {in_path}"))?;
    let mut in_mmap = unsafe { MmapMut::map_mut(&in_file) }.with_context(|| format!("mapping {in_path}"))?;
    let in_channel = Channel::load_from_mut(&mut in_mmap).map_err(anyhow::Error::from)?;

    let out_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&out_path)
        .with_context(|| format!("opening {out_path}"))?;
    let mut out_mmap = unsafe { MmapMut::map_mut(&out_file) }.with_context(|| format!("mapping {out_path}"))?;
    let out_channel = Channel::load_from_mut(&mut out_mmap).map_err(anyhow::Error::from)?;

    let writer = Writer::init(out_channel, protocol, element_size, fresh_epoch()).map_err(anyhow::Error::from)?;
    let mut reader = Reader::init(protocol);
    let mut buf = vec![0u8; element_size as usize];

    info!("echoing {in_path} -> {out_path}, protocol={protocol:#x}, element_size={element_size}");

    loop {
        match reader.read(in_channel, &mut buf) {
            ReadResult::Success => {
                writer.write(&buf).map_err(anyhow::Error::from)?;
                debug!("echoed element, rc={}", reader.read_count());
            }
            ReadResult::EpochChanged => {
                info!("input channel (re)synced, element_size={:?}", reader.element_size());
            }
            ReadResult::OverrunDetected => {
                warn!("input overrun, draining backlog");
                reader.drain(in_channel);
            }
            ReadResult::IncompatibleInterface => {
                error!("input channel protocol mismatch, stopping");
                break;
            }
            ReadResult::Inactive | ReadResult::NoData => {
                std::thread::sleep(Duration::from_millis(poll_ms));
            }
        }
    }
    Ok(())
}
