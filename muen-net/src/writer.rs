//! Transmit path: frame encoding, per-mark PMTU enforcement and event
//! notification (component E, writer side). Grounded on `muennet_xmit()`
//! in `muennet/writer.c`.
use anyhow::anyhow;
use muen_core::error::{MuenError, ResultExt, TypedResult};
use muen_core::writer::Writer as ChannelWriter;

use crate::device::ParentDevice;
use crate::frame::{self, EthHdr, FrameMode, NetProtocol, NET_HDR_LEN};
use crate::pmtu::PmtuTable;

/// Transmits frames onto one channel in the mode an interface was
/// configured for. Holds no lock of its own — the channel is single-writer
/// by construction, and the [`ParentDevice`] it reports statistics through
/// carries its own lock for the child table.
pub struct FramerWriter<'a, 'p> {
    channel: ChannelWriter<'a>,
    mode: FrameMode,
    pmtu: PmtuTable,
    parent: &'p ParentDevice,
    notify: Option<Box<dyn Fn() + Send + Sync + 'a>>,
    on_icmp: Option<Box<dyn Fn(&[u8]) + Send + Sync + 'a>>,
}

impl<'a, 'p> FramerWriter<'a, 'p> {
    pub fn new(channel: ChannelWriter<'a>, mode: FrameMode, pmtu: PmtuTable, parent: &'p ParentDevice) -> Self {
        Self {
            channel,
            mode,
            pmtu,
            parent,
            notify: None,
            on_icmp: None,
        }
    }

    /// Registers the callback that issues the channel's associated event
    /// trigger after a successful write. Typically wraps
    /// `AffinityRegistry::trigger_event`.
    pub fn on_write(&mut self, notify: impl Fn() + Send + Sync + 'a) {
        self.notify = Some(Box::new(notify));
    }

    /// Registers the sink that receives a synthesised ICMP "fragmentation
    /// needed"/"packet too big" reply for delivery back into the stack, the
    /// way `icmp_send`/`icmpv6_send` hand their reply to the IP layer in the
    /// original instead of dropping it.
    pub fn on_icmp_reply(&mut self, sink: impl Fn(&[u8]) + Send + Sync + 'a) {
        self.on_icmp = Some(Box::new(sink));
    }

    fn element_size(&self) -> usize {
        self.channel.element_size() as usize
    }

    fn write_slot(&self, slot: &[u8]) -> TypedResult<()> {
        self.channel.write(slot)?;
        if let Some(notify) = &self.notify {
            notify();
        }
        Ok(())
    }

    /// Transmits `frame` tagged with `mark` (ignored outside net-hdr mode).
    /// Oversized datagrams are fragmented or answered with an ICMP "too
    /// big" reply and dropped, exactly as the PMTU check in §4.E requires.
    pub fn xmit(&self, mark: u32, frame: &[u8]) -> TypedResult<()> {
        match self.mode {
            FrameMode::Raw => self.xmit_raw(frame),
            FrameMode::Eth => self.xmit_eth(frame),
            FrameMode::NetHdr => self.xmit_net_hdr(mark, frame),
        }
    }

    fn xmit_raw(&self, frame: &[u8]) -> TypedResult<()> {
        if frame.len() != self.element_size() {
            return Err(anyhow!(
                "raw frame is {} bytes, channel element is {}",
                frame.len(),
                self.element_size()
            ))
            .typ(MuenError::RegionTooSmall);
        }
        self.write_slot(frame)?;
        self.parent.stats().record_tx(frame.len());
        Ok(())
    }

    fn xmit_eth(&self, frame: &[u8]) -> TypedResult<()> {
        let mut slot = vec![0u8; self.element_size()];
        if EthHdr::encode_into(frame, &mut slot).is_err() {
            self.parent.stats().add_tx_dropped(1);
            return Ok(());
        }
        self.write_slot(&slot)?;
        self.parent.stats().record_tx(frame.len());
        Ok(())
    }

    fn xmit_net_hdr(&self, mark: u32, datagram: &[u8]) -> TypedResult<()> {
        let protocol = match NetProtocol::sniff(datagram) {
            Some(p) => p,
            None => {
                self.parent.stats().add_tx_dropped(1);
                return Ok(());
            }
        };

        let capacity = self.element_size().saturating_sub(NET_HDR_LEN) as u16;
        let limit = self.pmtu.get(mark).map(|m| m.min(capacity as u32) as u16).unwrap_or(capacity);

        let qos = derive_qos(datagram, protocol);

        if datagram.len() as u16 <= limit {
            return self.send_datagram(mark, protocol, qos, datagram);
        }

        match protocol {
            NetProtocol::Ipv4 if !ipv4_dont_fragment(datagram) => {
                let fragments = crate::pmtu::fragment_ipv4(datagram, limit).unwrap_or_default();
                if fragments.is_empty() {
                    self.parent.stats().add_tx_dropped(1);
                    return Ok(());
                }
                for fragment in fragments {
                    self.send_datagram(mark, protocol, qos, &fragment)?;
                }
                Ok(())
            }
            NetProtocol::Ipv4 => {
                self.parent.stats().add_tx_dropped(1);
                if let Ok(reply) = crate::pmtu::icmpv4_fragmentation_needed(datagram, limit) {
                    if let Some(sink) = &self.on_icmp {
                        sink(&reply);
                    }
                }
                Ok(())
            }
            NetProtocol::Ipv6 => {
                self.parent.stats().add_tx_dropped(1);
                if let Ok(reply) = crate::pmtu::icmpv6_packet_too_big(datagram, limit as u32) {
                    if let Some(sink) = &self.on_icmp {
                        sink(&reply);
                    }
                }
                Ok(())
            }
        }
    }

    fn send_datagram(&self, mark: u32, protocol: NetProtocol, qos: u8, datagram: &[u8]) -> TypedResult<()> {
        let mut slot = vec![0u8; self.element_size()];
        if frame::encode_net_hdr(&mut slot, mark, protocol, qos, datagram).is_err() {
            self.parent.stats().add_tx_dropped(1);
            return Ok(());
        }
        self.write_slot(&slot)?;
        self.parent.stats().record_tx(datagram.len());
        Ok(())
    }
}

fn ipv4_dont_fragment(datagram: &[u8]) -> bool {
    smoltcp::wire::Ipv4Packet::new_checked(datagram)
        .map(|p| p.dont_frag())
        .unwrap_or(true)
}

/// Derives `net_hdr.qos` from the datagram's DS field, as `writer.c` does:
/// `hdr->qos = ip_hdr->tos >> 2` for IPv4, `ip6_tclass(...) >> 2` for IPv6.
/// `dscp()`/`traffic_class()` already return the top six bits of the ToS/
/// traffic-class byte, so no further shift is needed.
fn derive_qos(datagram: &[u8], protocol: NetProtocol) -> u8 {
    match protocol {
        NetProtocol::Ipv4 => smoltcp::wire::Ipv4Packet::new_checked(datagram).map(|p| p.dscp()).unwrap_or(0),
        NetProtocol::Ipv6 => smoltcp::wire::Ipv6Packet::new_checked(datagram)
            .map(|p| p.traffic_class() >> 2)
            .unwrap_or(0),
    }
}
