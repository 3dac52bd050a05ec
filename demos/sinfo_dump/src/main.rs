//! Maps a sinfo directory page and dumps its resources at `info!` level,
//! mirroring the original boot-time resource dump. Takes the path to a
//! raw sinfo page as its sole argument, rather than the physical address
//! a real subject would receive as a boot parameter.
#[macro_use]
extern crate log;

use std::env;
use std::fs::File;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use muen_core::sinfo::Sinfo;

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
    let path = env::args().nth(1).context("usage: sinfo_dump <sinfo-page-file>")?;
    let file = File::open(&path).with_context(|| format!("opening {path}"))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("mapping {path}"))?;

    let sinfo = match Sinfo::parse(&mmap) {
        Ok(sinfo) => sinfo,
        Err(e) => bail!("{path} is not a valid sinfo page: {e}"),
    };

    info!("subject: {}", sinfo.subject_name());
    info!("tsc_khz: {}", sinfo.tsc_khz());
    sinfo.log_resources();
    Ok(())
}
