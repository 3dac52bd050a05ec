//! Lock-free single-producer ring write path (component D, writer half).
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;

use crate::channel::{Channel, NULL_EPOCH, SHMSTREAM20};
use crate::error::{MuenError, ResultExt, TypedResult};

static EPOCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produces a fresh, non-zero epoch for (re)activation.
///
/// Combines wall-clock nanoseconds with a process-wide sequence number so
/// that two activations within the same nanosecond still differ; `0`
/// (`NULL_EPOCH`) is reserved for "inactive" and is never returned.
pub fn fresh_epoch() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = EPOCH_SEQ.fetch_add(1, Ordering::Relaxed);
    (nanos ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15)).max(1)
}

/// The single writer of a channel. Holds no lock; the channel page itself
/// carries the only synchronisation state (`wsc`/`wc`).
pub struct Writer<'a> {
    channel: &'a Channel,
    element_size: u64,
}

impl<'a> Writer<'a> {
    /// Initialises `channel` for `element_size`-byte elements of `protocol`,
    /// following §4.C exactly: deactivate, zero counters, publish the
    /// ordinary fields, and only then publish the non-zero `epoch` with
    /// release ordering so a reader observing it sees everything before it.
    pub fn init(channel: &'a Channel, protocol: u64, element_size: u64, epoch: u64) -> TypedResult<Self> {
        if element_size == 0 {
            return Err(anyhow!("element_size must be non-zero")).typ(MuenError::RegionTooSmall);
        }

        channel.store_epoch_release(NULL_EPOCH);
        channel.store_wsc(0);
        channel.store_wc(0);

        let elements = channel.data_len() / element_size;
        if elements == 0 {
            return Err(anyhow!(
                "element_size {element_size} too large for {}-byte data region",
                channel.data_len()
            ))
            .typ(MuenError::RegionTooSmall);
        }

        channel.store_header(SHMSTREAM20, protocol, element_size, elements);
        channel.store_epoch_release(epoch.max(1));

        Ok(Self { channel, element_size })
    }

    /// Store `epoch ← 0` with release semantics; any concurrent reader
    /// observes inactivity on its next read.
    pub fn deactivate(&self) {
        self.channel.store_epoch_release(NULL_EPOCH);
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn elements(&self) -> u64 {
        self.channel.elements()
    }

    /// Writes one element, overwriting the oldest slot on wraparound without
    /// notice — overrun detection is entirely the reader's responsibility.
    pub fn write(&self, element: &[u8]) -> TypedResult<()> {
        if element.len() as u64 != self.element_size {
            return Err(anyhow!(
                "element is {} bytes, channel expects {}",
                element.len(),
                self.element_size
            ))
            .typ(MuenError::RegionTooSmall);
        }

        let elements = self.channel.elements();
        let wc = self.channel.wc();
        let slot = wc % elements;

        self.channel.store_wsc(wc + 1);
        self.channel.copy_in(slot, element);
        self.channel.store_wc(wc + 1);

        Ok(())
    }
}
