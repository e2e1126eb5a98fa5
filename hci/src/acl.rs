//! The bidirectional ACL data path between upper layers and the controller.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::config;
use crate::Error;

/// ACL packet header: handle plus flag bits, and data length.
const ACL_HDR: usize = 4;
const ACL_BUF: usize = config::MAX_HCI_PACKET_LEN;

/// Packet boundary flag of an ACL packet.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFlag {
    /// Start of a non-automatically-flushable L2CAP PDU.
    FirstNonAutoFlushable = 0b00,
    /// Continuation fragment.
    Continuing = 0b01,
    /// Start of an automatically-flushable L2CAP PDU.
    FirstAutoFlushable = 0b10,
    /// A complete, automatically-flushable L2CAP PDU.
    Complete = 0b11,
}

/// BC flag from controller to host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerBroadcastFlag {
    /// Point-to-point data.
    PointToPoint = 0b00,
    /// Broadcast to all active peripherals.
    NotParkedState = 0b01,
    /// Broadcast including parked peripherals.
    ParkedState = 0b10,
    /// Reserved for future use.
    Reserved = 0b11,
}

/// BC flag from host to controller.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBroadcastFlag {
    /// Point-to-point data.
    NoBroadcast = 0b00,
    /// Active peripheral broadcast.
    ActiveSlaveBroadcast = 0b01,
    /// Parked peripheral broadcast.
    ParkedSlaveBroadcast = 0b10,
    /// Reserved for future use.
    Reserved = 0b11,
}

/// An owned ACL data packet.
///
/// The layer ferries these between the queue ends and the driver without
/// looking at the payload; fragmentation and reassembly belong to the
/// connection management above.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AclPacket {
    bytes: Vec<u8, ACL_BUF>,
}

impl AclPacket {
    /// Build an outgoing ACL packet.
    pub fn new(handle: u16, pb: BoundaryFlag, bc: HostBroadcastFlag, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > ACL_BUF - ACL_HDR {
            return Err(Error::InsufficientSpace);
        }
        let mut raw_handle = handle & 0x0fff;
        raw_handle |= (pb as u16) << 12;
        raw_handle |= (bc as u16) << 14;

        let mut bytes = Vec::new();
        unwrap!(bytes.extend_from_slice(&raw_handle.to_le_bytes()));
        unwrap!(bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes()));
        unwrap!(bytes.extend_from_slice(payload));
        Ok(Self { bytes })
    }

    /// Parse an ACL packet from raw bytes as delivered by the driver.
    ///
    /// `data` may extend past the end of the packet; anything beyond the
    /// encoded data length is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < ACL_HDR {
            return Err(Error::InvalidPacket);
        }
        let total = ACL_HDR + u16::from_le_bytes([data[2], data[3]]) as usize;
        if total > ACL_BUF || data.len() < total {
            return Err(Error::InvalidPacket);
        }
        Ok(Self {
            bytes: unwrap!(Vec::from_slice(&data[..total])),
        })
    }

    fn raw_handle(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// The connection handle.
    pub fn handle(&self) -> u16 {
        self.raw_handle() & 0x0fff
    }

    /// The packet boundary flag.
    pub fn boundary_flag(&self) -> BoundaryFlag {
        match (self.raw_handle() >> 12) & 0b11 {
            0b00 => BoundaryFlag::FirstNonAutoFlushable,
            0b01 => BoundaryFlag::Continuing,
            0b10 => BoundaryFlag::FirstAutoFlushable,
            _ => BoundaryFlag::Complete,
        }
    }

    /// The broadcast flag, interpreted in the controller-to-host direction.
    pub fn broadcast_flag(&self) -> ControllerBroadcastFlag {
        match (self.raw_handle() >> 14) & 0b11 {
            0b00 => ControllerBroadcastFlag::PointToPoint,
            0b01 => ControllerBroadcastFlag::NotParkedState,
            0b10 => ControllerBroadcastFlag::ParkedState,
            _ => ControllerBroadcastFlag::Reserved,
        }
    }

    /// The ACL payload.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[ACL_HDR..]
    }

    /// The full packet, header included, as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub(crate) struct AclConduit {
    outbound: Channel<NoopRawMutex, AclPacket, { config::ACL_QUEUE_DEPTH }>,
    inbound: Channel<NoopRawMutex, AclPacket, { config::ACL_QUEUE_DEPTH }>,
}

impl AclConduit {
    pub(crate) fn new() -> Self {
        Self {
            outbound: Channel::new(),
            inbound: Channel::new(),
        }
    }

    pub(crate) fn up_end(&self) -> AclQueueEnd<'_> {
        AclQueueEnd { conduit: self }
    }

    /// Next packet to hand to the driver, in enqueue order.
    pub(crate) async fn next_outbound(&self) -> AclPacket {
        self.outbound.receive().await
    }

    /// Deliver a packet that arrived from the controller. If the upper
    /// layer is not draining its end the packet is dropped; the run loop
    /// must never stall behind a slow consumer.
    pub(crate) fn push_inbound(&self, packet: AclPacket) {
        if self.inbound.try_send(packet).is_err() {
            warn!("[hci] inbound acl queue full, dropping packet");
        }
    }
}

/// The upper-layer end of the ACL data path: read packets coming up from
/// the controller, write packets going down to it.
pub struct AclQueueEnd<'d> {
    conduit: &'d AclConduit,
}

impl<'d> AclQueueEnd<'d> {
    /// Receive the next incoming ACL packet.
    pub async fn read(&self) -> AclPacket {
        self.conduit.inbound.receive().await
    }

    /// Receive an incoming ACL packet if one is ready.
    pub fn try_read(&self) -> Option<AclPacket> {
        self.conduit.inbound.try_receive().ok()
    }

    /// Queue a packet for transmission, waiting for room in the queue.
    /// The queue is the only source of backpressure toward upper layers.
    pub async fn write(&self, packet: AclPacket) {
        self.conduit.outbound.send(packet).await
    }

    /// Queue a packet for transmission without waiting.
    pub fn try_write(&self, packet: AclPacket) -> Result<(), Error> {
        self.conduit
            .outbound
            .try_send(packet)
            .map_err(|_| Error::AclQueueFull)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn encode_decode_flags_and_handle() {
        let packet = AclPacket::new(0x0040, BoundaryFlag::FirstAutoFlushable, HostBroadcastFlag::NoBroadcast, &[1, 2, 3]).unwrap();
        assert_eq!(packet.as_bytes(), &[0x40, 0x20, 0x03, 0x00, 1, 2, 3]);
        assert_eq!(packet.handle(), 0x0040);
        assert_eq!(packet.boundary_flag(), BoundaryFlag::FirstAutoFlushable);
        assert_eq!(packet.broadcast_flag(), ControllerBroadcastFlag::PointToPoint);
        assert_eq!(packet.payload(), &[1, 2, 3]);
    }

    #[test]
    fn parse_ignores_trailing_receive_buffer() {
        let mut buf = [0u8; 32];
        buf[..6].copy_from_slice(&[0x07, 0x10, 0x02, 0x00, 0xaa, 0xbb]);
        let packet = AclPacket::parse(&buf).unwrap();
        assert_eq!(packet.handle(), 0x0007);
        assert_eq!(packet.boundary_flag(), BoundaryFlag::Continuing);
        assert_eq!(packet.payload(), &[0xaa, 0xbb]);
    }

    #[test]
    fn parse_rejects_truncated_packets() {
        assert_eq!(AclPacket::parse(&[0x07, 0x10, 0x02]), Err(Error::InvalidPacket));
        assert_eq!(AclPacket::parse(&[0x07, 0x10, 0x02, 0x00, 0xaa]), Err(Error::InvalidPacket));
    }

    #[test]
    fn inbound_overflow_drops_newest_packet() {
        let conduit = AclConduit::new();
        for i in 0..=config::ACL_QUEUE_DEPTH {
            let packet = AclPacket::new(i as u16, BoundaryFlag::Complete, HostBroadcastFlag::NoBroadcast, &[]).unwrap();
            conduit.push_inbound(packet);
        }
        let up = conduit.up_end();
        for i in 0..config::ACL_QUEUE_DEPTH {
            assert_eq!(up.try_read().unwrap().handle(), i as u16);
        }
        assert!(up.try_read().is_none());
    }
}
