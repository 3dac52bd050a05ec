//! Channel header layout and activation (component C).
//!
//! A channel page is `struct muchannel` from `include/muen/channel.h`
//! reborn as a Rust DST: a fixed eight-word atomic header followed by a
//! flexible array of payload bytes. The header words are the only atomic
//! cells in the page; everything past them is reached through plain byte
//! copies guarded by the header's release/acquire fences, never through a
//! typed struct with ordinary fields, since a peer partition can overwrite
//! the data region at any instant the fences don't forbid.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;

use crate::error::{MuenError, ResultExt, TypedResult};

/// `SHMSTREAM20` transport magic.
pub const SHMSTREAM20: u64 = 0x487312b6b79a9b6d;
/// Reserved epoch value meaning "channel inactive".
pub const NULL_EPOCH: u64 = 0;

#[repr(C)]
pub struct Channel {
    transport: AtomicU64,
    epoch: AtomicU64,
    protocol: AtomicU64,
    element_size: AtomicU64,
    elements: AtomicU64,
    _reserved: u64,
    wsc: AtomicU64,
    wc: AtomicU64,
    data: UnsafeCell<[u8]>,
}

// Safety: every access to `data` goes through `data_slice`, and every access
// to the header words goes through the atomics above; the struct carries no
// other interior state.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl ptr_meta::Pointee for Channel {
    type Metadata = usize;
}

impl Channel {
    /// Size in bytes of the eight header words, i.e. where `data[]` starts.
    pub const HEADER_SIZE: usize = 64;

    fn buf_to_self(buffer: *const [u8]) -> *const Self {
        let (ptr, mut len): (*const (), usize) = ptr_meta::PtrExt::to_raw_parts(buffer);
        len -= Self::HEADER_SIZE;
        ptr_meta::from_raw_parts(ptr, len)
    }

    fn buf_to_self_mut(buffer: *mut [u8]) -> *mut Self {
        let (ptr, mut len): (*mut (), usize) = ptr_meta::PtrExt::to_raw_parts(buffer);
        len -= Self::HEADER_SIZE;
        ptr_meta::from_raw_parts_mut(ptr, len)
    }

    /// Borrows `bytes` as a channel page without activating it.
    ///
    /// # Errors
    /// [`MuenError::RegionTooSmall`] if `bytes` has no room for the header
    /// plus at least one byte of payload.
    pub fn load_from(bytes: &[u8]) -> TypedResult<&Channel> {
        Self::check_len(bytes.len())?;
        Ok(unsafe { &*Self::buf_to_self(bytes as *const [u8]) })
    }

    /// As [`Channel::load_from`], for a mutably-borrowed page (the writer's
    /// side). The returned reference is still shared: all mutation happens
    /// through the header atomics and the `UnsafeCell` payload, exactly as
    /// it would for a page a peer partition can also write.
    pub fn load_from_mut(bytes: &mut [u8]) -> TypedResult<&Channel> {
        Self::check_len(bytes.len())?;
        Ok(unsafe { &*Self::buf_to_self_mut(bytes as *mut [u8]) })
    }

    fn check_len(len: usize) -> TypedResult<()> {
        if len <= Self::HEADER_SIZE {
            return Err(anyhow!(
                "channel region of {len} bytes has no room for a header plus data"
            ))
            .typ(MuenError::RegionTooSmall);
        }
        Ok(())
    }

    pub fn transport(&self) -> u64 {
        self.transport.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn protocol(&self) -> u64 {
        self.protocol.load(Ordering::Acquire)
    }

    pub fn element_size(&self) -> u64 {
        self.element_size.load(Ordering::Acquire)
    }

    pub fn elements(&self) -> u64 {
        self.elements.load(Ordering::Acquire)
    }

    pub fn wsc(&self) -> u64 {
        self.wsc.load(Ordering::Acquire)
    }

    pub fn wc(&self) -> u64 {
        self.wc.load(Ordering::Acquire)
    }

    /// `epoch != 0`, i.e. a writer has activated this channel.
    pub fn is_active(&self) -> bool {
        self.epoch() != NULL_EPOCH
    }

    fn data_slice(&self) -> &mut [u8] {
        // Safety: `data` is exactly `bytes.len() - HEADER_SIZE` bytes long,
        // as established when the page was borrowed.
        unsafe { self.data.get().as_mut().unwrap() }
    }

    pub(crate) fn data_len(&self) -> u64 {
        self.data_slice().len() as u64
    }

    pub(crate) fn copy_out(&self, slot: u64, element_size: u64, out: &mut [u8]) {
        let off = (slot * element_size) as usize;
        let len = element_size as usize;
        out[..len].copy_from_slice(&self.data_slice()[off..off + len]);
    }

    pub(crate) fn copy_in(&self, slot: u64, element: &[u8]) {
        let off = (slot * element.len() as u64) as usize;
        self.data_slice()[off..off + element.len()].copy_from_slice(element);
    }

    pub(crate) fn store_header(&self, transport: u64, protocol: u64, element_size: u64, elements: u64) {
        self.transport.store(transport, Ordering::Relaxed);
        self.protocol.store(protocol, Ordering::Relaxed);
        self.element_size.store(element_size, Ordering::Relaxed);
        self.elements.store(elements, Ordering::Relaxed);
    }

    pub(crate) fn store_wsc(&self, v: u64) {
        self.wsc.store(v, Ordering::Release);
    }

    pub(crate) fn store_wc(&self, v: u64) {
        self.wc.store(v, Ordering::Release);
    }

    pub(crate) fn store_epoch_release(&self, v: u64) {
        self.epoch.store(v, Ordering::Release);
    }
}
