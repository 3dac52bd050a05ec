//! Receive path: the reader dispatch loop, frame decoding and child
//! demultiplex (component E, reader side). Grounded on
//! `muennet_reader_work()` in `muennet/reader.c`.
use muen_core::channel::Channel;
use muen_core::reader::{ReadResult, Reader as ChannelReader};

use crate::device::ParentDevice;
use crate::frame::{self, EthHdr, FrameMode};

/// One MiB, the reader-side element-size sanity bound from §4.E: an
/// `EPOCH_CHANGED` that advertises a larger element size is treated as a
/// misconfigured or hostile peer and the stream is suspended.
const MAX_ELEMENT_SIZE: u64 = 1 << 20;

/// Outcome of one [`FramerReader::poll`] call, collapsing `ReadResult`
/// down to what a caller's event loop needs to decide: keep polling,
/// back off, or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A frame was decoded and dispatched; `mark` is `0` outside net-hdr
    /// mode.
    Delivered { mark: u32 },
    /// A frame was dropped at the framing layer; a per-child error
    /// counter was bumped.
    FrameDropped,
    /// The writer reset or changed shape; any half-parsed state should be
    /// discarded, but polling continues.
    Resynced,
    /// An overrun was recovered from; polling continues.
    OverrunRecovered,
    /// Nothing to do right now; caller should poll-sleep or wait on the
    /// associated vector.
    Idle,
    /// The stream is incompatible or advertised an unusable element size;
    /// polling should stop until reconfigured.
    Suspended,
}

pub struct FramerReader<'p> {
    reader: ChannelReader,
    mode: FrameMode,
    parent: &'p ParentDevice,
    buf: Vec<u8>,
    suspended: bool,
    warned_incompatible: bool,
}

impl<'p> FramerReader<'p> {
    pub fn new(protocol: u64, mode: FrameMode, parent: &'p ParentDevice) -> Self {
        Self {
            reader: ChannelReader::init(protocol),
            mode,
            parent,
            buf: vec![0u8; MAX_ELEMENT_SIZE as usize],
            suspended: false,
            warned_incompatible: false,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Drives one `read` and dispatches on its result, per the table in
    /// §4.E.
    pub fn poll(&mut self, channel: &Channel) -> PollOutcome {
        if self.suspended {
            return PollOutcome::Suspended;
        }

        match self.reader.read(channel, &mut self.buf) {
            ReadResult::Success => self.deliver(),
            ReadResult::EpochChanged => self.resync(),
            ReadResult::OverrunDetected => {
                self.parent.stats().add_rx_over_errors(1);
                self.reader.drain(channel);
                PollOutcome::OverrunRecovered
            }
            ReadResult::IncompatibleInterface => {
                if !self.warned_incompatible {
                    warn!("muen-net: reader protocol mismatch, suspending stream");
                    self.warned_incompatible = true;
                }
                self.suspended = true;
                PollOutcome::Suspended
            }
            ReadResult::NoData | ReadResult::Inactive => PollOutcome::Idle,
        }
    }

    fn resync(&mut self) -> PollOutcome {
        match self.reader.element_size() {
            Some(size) if size > 0 && size <= MAX_ELEMENT_SIZE => PollOutcome::Resynced,
            _ => {
                warn!("muen-net: channel advertised an unusable element size, suspending");
                self.suspended = true;
                PollOutcome::Suspended
            }
        }
    }

    fn deliver(&mut self) -> PollOutcome {
        let element_size = match self.reader.element_size() {
            Some(size) => size as usize,
            None => return PollOutcome::Idle,
        };
        let slot = &self.buf[..element_size];

        match self.mode {
            FrameMode::Raw => {
                self.parent.stats().record_rx(slot.len());
                PollOutcome::Delivered { mark: 0 }
            }
            FrameMode::Eth => match EthHdr::decode_from(slot) {
                Ok(eth_frame) => {
                    self.parent.stats().record_rx(eth_frame.len());
                    PollOutcome::Delivered { mark: 0 }
                }
                Err(_) => {
                    self.parent.stats().add_rx_frame_errors(1);
                    PollOutcome::FrameDropped
                }
            },
            FrameMode::NetHdr => match frame::decode_net_hdr(slot) {
                Ok((hdr, datagram)) => {
                    let child = self.parent.dispatch(hdr.mark);
                    self.parent.with_stats(child, |s| s.record_rx(datagram.len()));
                    PollOutcome::Delivered { mark: hdr.mark }
                }
                Err(_) => {
                    self.parent.stats().add_rx_frame_errors(1);
                    PollOutcome::FrameDropped
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use muen_core::writer::Writer as ChannelWriter;

    use super::*;
    use crate::pmtu::PmtuTable;
    use crate::writer::FramerWriter;

    fn page(data_len: usize) -> Vec<u8> {
        vec![0u8; Channel::HEADER_SIZE + data_len]
    }

    #[test]
    fn raw_mode_delivers_and_counts() {
        let mut bytes = page(64);
        let channel = Channel::load_from_mut(&mut bytes).unwrap();
        let writer = ChannelWriter::init(channel, 9, 32, 1).unwrap();
        writer.write(&[7u8; 32]).unwrap();

        let parent = ParentDevice::new();
        let mut reader = FramerReader::new(9, FrameMode::Raw, &parent);

        assert_eq!(reader.poll(channel), PollOutcome::Resynced);
        assert_eq!(reader.poll(channel), PollOutcome::Delivered { mark: 0 });
        assert_eq!(parent.stats().rx_packets(), 1);
    }

    /// P8: net-hdr round trip dispatches by mark and counts rx stats.
    #[test]
    fn net_hdr_mode_dispatches_by_mark() {
        let mut bytes = page(64);
        let channel = Channel::load_from_mut(&mut bytes).unwrap();
        let writer = ChannelWriter::init(channel, 9, 32, 1).unwrap();
        let tx_parent = ParentDevice::new();
        let framer = FramerWriter::new(writer, FrameMode::NetHdr, PmtuTable::empty(), &tx_parent);

        let mut datagram = vec![0u8; 16];
        datagram[0] = 0x45;
        framer.xmit(3, &datagram).unwrap();

        let parent = ParentDevice::new();
        let child = parent.attach_child("mark3");
        parent.bind_mark(child, 3).unwrap();
        let mut reader = FramerReader::new(9, FrameMode::NetHdr, &parent);

        reader.poll(channel); // EpochChanged
        assert_eq!(reader.poll(channel), PollOutcome::Delivered { mark: 3 });
        parent.with_stats(child, |s| assert_eq!(s.rx_packets(), 1));
    }

    #[test]
    fn incompatible_protocol_suspends_once() {
        let mut bytes = page(64);
        let channel = Channel::load_from_mut(&mut bytes).unwrap();
        let _writer = ChannelWriter::init(channel, 1, 32, 1).unwrap();

        let parent = ParentDevice::new();
        let mut reader = FramerReader::new(2, FrameMode::Raw, &parent);

        assert_eq!(reader.poll(channel), PollOutcome::Suspended);
        assert!(reader.is_suspended());
        assert_eq!(reader.poll(channel), PollOutcome::Suspended);
    }

    #[test]
    fn overrun_bumps_counter_and_recovers() {
        let mut bytes = page(64); // elements = 4 at 16 bytes
        let channel = Channel::load_from_mut(&mut bytes).unwrap();
        let writer = ChannelWriter::init(channel, 1, 16, 1).unwrap();

        let parent = ParentDevice::new();
        let mut reader = FramerReader::new(1, FrameMode::Raw, &parent);
        reader.poll(channel); // sync

        for i in 0..6u8 {
            writer.write(&[i; 16]).unwrap();
        }
        assert_eq!(reader.poll(channel), PollOutcome::OverrunRecovered);
        assert_eq!(parent.stats().rx_over_errors(), 1);
    }
}
