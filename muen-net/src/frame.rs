//! Frame envelopes carried inside one channel element (component E, wire
//! layer). Grounded on `struct net_hdr`/`struct eth_hdr` in
//! `muennet/internal.h`.
use thiserror::Error;

use crate::config::Flags;

/// Which of the three envelopes (§3) an interface uses. Chosen once from
/// its `flags` at construction time; `net_hdr` takes priority over
/// `eth_dev` if both are somehow set, since the original never combines
/// them in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Raw,
    NetHdr,
    Eth,
}

impl FrameMode {
    pub fn from_flags(flags: Flags) -> Self {
        if flags.net_hdr {
            FrameMode::NetHdr
        } else if flags.eth_dev {
            FrameMode::Eth
        } else {
            FrameMode::Raw
        }
    }
}

/// `net_hdr.protocol` values the original recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetProtocol {
    Ipv4,
    Ipv6,
}

impl NetProtocol {
    const IPPROTO_IPIP: u8 = 4;
    const IPPROTO_IPV6: u8 = 41;

    pub fn to_wire(self) -> u8 {
        match self {
            NetProtocol::Ipv4 => Self::IPPROTO_IPIP,
            NetProtocol::Ipv6 => Self::IPPROTO_IPV6,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            Self::IPPROTO_IPIP => Some(NetProtocol::Ipv4),
            Self::IPPROTO_IPV6 => Some(NetProtocol::Ipv6),
            _ => None,
        }
    }

    /// Detects the protocol from the leading nibble of an IP datagram, the
    /// way the writer path picks `net_hdr.protocol` from the packet it is
    /// about to send rather than from caller metadata.
    pub fn sniff(datagram: &[u8]) -> Option<Self> {
        match datagram.first()? >> 4 {
            4 => Some(NetProtocol::Ipv4),
            6 => Some(NetProtocol::Ipv6),
            _ => None,
        }
    }
}

pub const NET_HDR_LEN: usize = 8;

/// `{mark:u32, length:u16, protocol:u8, qos:u8}`, little-endian, packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHdr {
    pub mark: u32,
    pub length: u16,
    pub protocol: u8,
    pub qos: u8,
}

impl NetHdr {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.mark.to_le_bytes());
        out[4..6].copy_from_slice(&self.length.to_le_bytes());
        out[6] = self.protocol;
        out[7] = self.qos;
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NET_HDR_LEN {
            return None;
        }
        Some(Self {
            mark: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            length: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
            protocol: bytes[6],
            qos: bytes[7],
        })
    }
}

pub const ETH_HDR_LEN: usize = 2;

/// `{length:u16}` placed at the tail of an eth-mode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHdr {
    pub length: u16,
}

impl EthHdr {
    /// Writes the header at the tail of `slot` and the frame at its head,
    /// zero-padding whatever lies between them.
    pub fn encode_into(frame: &[u8], slot: &mut [u8]) -> Result<(), FrameError> {
        let tail = slot.len().checked_sub(ETH_HDR_LEN).ok_or(FrameError::SlotTooSmall)?;
        if frame.len() > tail {
            return Err(FrameError::FrameTooLarge);
        }
        slot[..frame.len()].copy_from_slice(frame);
        for b in &mut slot[frame.len()..tail] {
            *b = 0;
        }
        slot[tail..].copy_from_slice(&(frame.len() as u16).to_le_bytes());
        Ok(())
    }

    /// Reads the tail length, then returns the leading frame bytes it
    /// describes.
    pub fn decode_from(slot: &[u8]) -> Result<&[u8], FrameError> {
        let tail = slot.len().checked_sub(ETH_HDR_LEN).ok_or(FrameError::SlotTooSmall)?;
        let length = u16::from_le_bytes(slot[tail..].try_into().unwrap()) as usize;
        if length > tail {
            return Err(FrameError::UndersizedTailroom);
        }
        Ok(&slot[..length])
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("slot has no room for the frame header")]
    SlotTooSmall,
    #[error("frame is larger than its slot can carry")]
    FrameTooLarge,
    #[error("net-hdr length exceeds the element's payload capacity")]
    LengthOutOfBounds,
    #[error("eth-hdr tail length exceeds available tailroom")]
    UndersizedTailroom,
    #[error("net-hdr protocol byte is neither IPIP nor IPV6")]
    UnknownProtocol,
}

/// Writes `{mark, protocol, qos}` plus `datagram` into `slot`, which must be
/// at least `NET_HDR_LEN + datagram.len()` bytes.
pub fn encode_net_hdr(slot: &mut [u8], mark: u32, protocol: NetProtocol, qos: u8, datagram: &[u8]) -> Result<(), FrameError> {
    let capacity = slot.len().checked_sub(NET_HDR_LEN).ok_or(FrameError::SlotTooSmall)?;
    if datagram.len() > capacity {
        return Err(FrameError::LengthOutOfBounds);
    }
    NetHdr {
        mark,
        length: datagram.len() as u16,
        protocol: protocol.to_wire(),
        qos,
    }
    .encode(&mut slot[..NET_HDR_LEN]);
    slot[NET_HDR_LEN..NET_HDR_LEN + datagram.len()].copy_from_slice(datagram);
    Ok(())
}

/// Decodes a net-hdr slot into `(header, datagram)`.
pub fn decode_net_hdr(slot: &[u8]) -> Result<(NetHdr, &[u8]), FrameError> {
    let hdr = NetHdr::decode(slot).ok_or(FrameError::SlotTooSmall)?;
    let capacity = slot.len() - NET_HDR_LEN;
    let length = hdr.length as usize;
    if length > capacity {
        return Err(FrameError::LengthOutOfBounds);
    }
    if NetProtocol::from_wire(hdr.protocol).is_none() {
        return Err(FrameError::UnknownProtocol);
    }
    Ok((hdr, &slot[NET_HDR_LEN..NET_HDR_LEN + length]))
}
