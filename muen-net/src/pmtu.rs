//! Per-mark PMTU table, IPv4 fragmentation and ICMP "too big" synthesis
//! (component E). Grounded on the PMTU check in `muennet_xmit()` in
//! `muennet/writer.c`, which either calls `ip_do_fragment` (DF clear) or
//! `icmp_send`/`icmpv6_send` (DF set) when a datagram exceeds `pmtu[mark]`.
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, IpAddress, Ipv4Packet, Ipv4Repr,
    Ipv6Packet, Ipv6Repr,
};
use thiserror::Error;

/// Read-only `pmtu[1..=M]: u32` table, loaded once from its sinfo-backed
/// memory region. `mark 0` and any mark beyond `M` carry no limit.
#[derive(Debug, Clone)]
pub struct PmtuTable {
    entries: Vec<u32>,
}

impl PmtuTable {
    pub fn load(bytes: &[u8]) -> Self {
        let entries = bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
        Self { entries }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// The PMTU bound to `mark`, or `None` if unconfigured (no limit).
    pub fn get(&self, mark: u32) -> Option<u32> {
        if mark == 0 {
            return None;
        }
        self.entries.get(mark as usize - 1).copied().filter(|&m| m != 0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PmtuError {
    #[error("datagram too short to carry a valid IP header")]
    Malformed,
    #[error("PMTU smaller than the IP header leaves no room for payload")]
    MtuTooSmall,
}

/// Splits an IPv4 `datagram` into `ip_do_fragment`-style fragments no
/// larger than `mtu` bytes, each carrying a copy of the original header
/// with `frag_offset`/`more_frags` and checksum updated.
pub fn fragment_ipv4(datagram: &[u8], mtu: u16) -> Result<Vec<Vec<u8>>, PmtuError> {
    let packet = Ipv4Packet::new_checked(datagram).map_err(|_| PmtuError::Malformed)?;
    let header_len = packet.header_len() as usize;
    let payload = packet.payload();

    let max_payload = (mtu as usize).checked_sub(header_len).ok_or(PmtuError::MtuTooSmall)?;
    if max_payload < 8 {
        return Err(PmtuError::MtuTooSmall);
    }
    let chunk_len = max_payload & !7; // RFC 791: fragment payloads are multiples of 8 bytes, except the last.

    let base_offset = packet.frag_offset();
    let mut fragments = Vec::new();
    for (i, chunk) in payload.chunks(chunk_len).enumerate() {
        let is_last = (i + 1) * chunk_len >= payload.len();
        let mut buf = vec![0u8; header_len + chunk.len()];
        {
            let mut frag = Ipv4Packet::new_unchecked(&mut buf[..]);
            frag.set_version(4);
            frag.set_header_len(header_len as u8);
            frag.set_dscp(packet.dscp());
            frag.set_ecn(packet.ecn());
            frag.set_total_len((header_len + chunk.len()) as u16);
            frag.set_ident(packet.ident());
            frag.set_dont_frag(false);
            frag.set_more_frags(!is_last || packet.more_frags());
            frag.set_frag_offset(base_offset + (i * chunk_len) as u16);
            frag.set_hop_limit(packet.hop_limit());
            frag.set_next_header(packet.next_header());
            frag.set_src_addr(packet.src_addr());
            frag.set_dst_addr(packet.dst_addr());
            frag.payload_mut().copy_from_slice(chunk);
            frag.fill_checksum();
        }
        fragments.push(buf);
    }
    Ok(fragments)
}

/// Synthesises an ICMPv4 "fragmentation needed" datagram in reply to
/// `original`, as `icmp_send(skb, ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED,
/// htonl(mtu))` does. The original IP header plus its first 8 payload
/// bytes are embedded per RFC 1191.
pub fn icmpv4_fragmentation_needed(original: &[u8], next_hop_mtu: u16) -> Result<Vec<u8>, PmtuError> {
    let orig = Ipv4Packet::new_checked(original).map_err(|_| PmtuError::Malformed)?;
    let embed_len = orig.header_len() as usize + orig.payload().len().min(8);
    let embedded = &original[..embed_len.min(original.len())];

    let orig_repr = Ipv4Repr::parse(&orig, &ChecksumCapabilities::default()).map_err(|_| PmtuError::Malformed)?;

    let icmp_repr = Icmpv4Repr::DstUnreachable {
        reason: Icmpv4DstUnreachable::FragmentationRequired { next_hop_mtu },
        header: orig_repr,
        data: embedded,
    };

    let reply_repr = Ipv4Repr {
        src_addr: orig_repr.dst_addr,
        dst_addr: orig_repr.src_addr,
        next_header: smoltcp::wire::IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; reply_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    reply_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());
    Ok(buf)
}

/// Synthesises an ICMPv6 "Packet Too Big" datagram, as
/// `icmpv6_send(skb, ICMPV6_PKT_TOOBIG, 0, mtu)` does.
pub fn icmpv6_packet_too_big(original: &[u8], mtu: u32) -> Result<Vec<u8>, PmtuError> {
    let orig = Ipv6Packet::new_checked(original).map_err(|_| PmtuError::Malformed)?;
    let embedded = &original[..original.len().min(1232)]; // RFC 4443 §3.2: as much as fits without exceeding the minimum IPv6 MTU.

    let icmp_repr = Icmpv6Repr::PacketTooBig { mtu, data: embedded };

    let reply_repr = Ipv6Repr {
        src_addr: orig.dst_addr(),
        dst_addr: orig.src_addr(),
        next_header: smoltcp::wire::IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; reply_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ip_packet = Ipv6Packet::new_unchecked(&mut buf[..]);
    reply_repr.emit(&mut ip_packet);
    let mut icmp_packet = Icmpv6Packet::new_unchecked(ip_packet.payload_mut());
    icmp_repr.emit(
        &IpAddress::Ipv6(reply_repr.src_addr),
        &IpAddress::Ipv6(reply_repr.dst_addr),
        &mut icmp_packet,
        &ChecksumCapabilities::default(),
    );
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmtu_table_looks_up_by_mark() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1200u32.to_le_bytes()); // mark 1
        bytes.extend_from_slice(&0u32.to_le_bytes()); // mark 2: unconfigured
        let table = PmtuTable::load(&bytes);
        assert_eq!(table.get(1), Some(1200));
        assert_eq!(table.get(2), None);
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn mark_zero_never_has_a_limit() {
        let table = PmtuTable::load(&[]);
        assert_eq!(table.get(0), None);
    }

    fn ipv4_datagram(payload: &[u8], dscp: u8, ecn: u8) -> Vec<u8> {
        let header_len = 20;
        let mut buf = vec![0u8; header_len + payload.len()];
        let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
        packet.set_version(4);
        packet.set_header_len(header_len as u8);
        packet.set_dscp(dscp);
        packet.set_ecn(ecn);
        packet.set_total_len((header_len + payload.len()) as u16);
        packet.set_ident(0x1234);
        packet.set_dont_frag(false);
        packet.set_hop_limit(64);
        packet.set_next_header(smoltcp::wire::IpProtocol::Udp);
        packet.set_src_addr(smoltcp::wire::Ipv4Address::new(10, 0, 0, 1));
        packet.set_dst_addr(smoltcp::wire::Ipv4Address::new(10, 0, 0, 2));
        packet.payload_mut().copy_from_slice(payload);
        packet.fill_checksum();
        buf
    }

    #[test]
    fn fragment_ipv4_splits_and_reassembles_the_payload() {
        let payload: Vec<u8> = (0..100u32).map(|b| b as u8).collect();
        let datagram = ipv4_datagram(&payload, 0x2E, 0x1);

        let fragments = fragment_ipv4(&datagram, 48).unwrap();
        assert!(fragments.len() > 1);

        let mut reassembled = Vec::new();
        for (i, frag) in fragments.iter().enumerate() {
            let packet = Ipv4Packet::new_checked(frag).unwrap();
            assert_eq!(packet.dscp(), 0x2E);
            assert_eq!(packet.ecn(), 0x1);
            assert_eq!(packet.ident(), 0x1234);
            assert!(!packet.dont_frag());
            assert_eq!(packet.more_frags(), i + 1 != fragments.len());
            assert_eq!(packet.frag_offset() as usize, reassembled.len());
            reassembled.extend_from_slice(packet.payload());
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn fragment_ipv4_rejects_mtu_with_no_room_for_payload() {
        let datagram = ipv4_datagram(&[0u8; 16], 0, 0);
        assert_eq!(fragment_ipv4(&datagram, 20), Err(PmtuError::MtuTooSmall));
    }

    #[test]
    fn icmpv4_fragmentation_needed_embeds_original_header_and_mtu() {
        let datagram = ipv4_datagram(&[0xAAu8; 32], 0, 0);
        let reply = icmpv4_fragmentation_needed(&datagram, 1400).unwrap();

        let reply_packet = Ipv4Packet::new_checked(&reply).unwrap();
        assert_eq!(reply_packet.next_header(), smoltcp::wire::IpProtocol::Icmp);
        assert_eq!(reply_packet.src_addr(), smoltcp::wire::Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(reply_packet.dst_addr(), smoltcp::wire::Ipv4Address::new(10, 0, 0, 1));

        let icmp_packet = Icmpv4Packet::new_checked(reply_packet.payload()).unwrap();
        let icmp_repr = Icmpv4Repr::parse(&icmp_packet, &ChecksumCapabilities::default()).unwrap();
        match icmp_repr {
            Icmpv4Repr::DstUnreachable {
                reason: Icmpv4DstUnreachable::FragmentationRequired { next_hop_mtu },
                header,
                ..
            } => {
                assert_eq!(next_hop_mtu, 1400);
                assert_eq!(header.src_addr, smoltcp::wire::Ipv4Address::new(10, 0, 0, 1));
                assert_eq!(header.dst_addr, smoltcp::wire::Ipv4Address::new(10, 0, 0, 2));
            }
            other => panic!("unexpected ICMPv4 reply: {other:?}"),
        }
    }

    fn ipv6_datagram(payload: &[u8], traffic_class: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 40 + payload.len()];
        let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
        packet.set_version(6);
        packet.set_traffic_class(traffic_class);
        packet.set_payload_len(payload.len() as u16);
        packet.set_next_header(smoltcp::wire::IpProtocol::Udp);
        packet.set_hop_limit(64);
        packet.set_src_addr(smoltcp::wire::Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        packet.set_dst_addr(smoltcp::wire::Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
        packet.payload_mut().copy_from_slice(payload);
        buf
    }

    #[test]
    fn icmpv6_packet_too_big_carries_mtu_and_swapped_addresses() {
        let datagram = ipv6_datagram(&[0xBBu8; 32], 0);
        let reply = icmpv6_packet_too_big(&datagram, 1280).unwrap();

        let reply_packet = Ipv6Packet::new_checked(&reply).unwrap();
        assert_eq!(reply_packet.next_header(), smoltcp::wire::IpProtocol::Icmpv6);
        assert_eq!(reply_packet.src_addr(), smoltcp::wire::Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
        assert_eq!(reply_packet.dst_addr(), smoltcp::wire::Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));

        let icmp_packet = Icmpv6Packet::new_checked(reply_packet.payload()).unwrap();
        let icmp_repr = Icmpv6Repr::parse(
            &IpAddress::Ipv6(reply_packet.src_addr()),
            &IpAddress::Ipv6(reply_packet.dst_addr()),
            &icmp_packet,
            &ChecksumCapabilities::default(),
        )
        .unwrap();
        match icmp_repr {
            Icmpv6Repr::PacketTooBig { mtu, .. } => assert_eq!(mtu, 1280),
            other => panic!("unexpected ICMPv6 reply: {other:?}"),
        }
    }
}
