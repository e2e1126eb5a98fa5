//! In-memory driver for exercising the layer without a controller.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::config;
use crate::driver::{HciDriver, HciMessageType};

type Packet = (HciMessageType, Vec<u8, { config::MAX_HCI_PACKET_LEN }>);

/// Both ends of a fake transport: tests inject controller traffic and
/// observe what the layer transmits.
pub(crate) struct MockBus {
    to_host: Channel<NoopRawMutex, Packet, 8>,
    from_host: Channel<NoopRawMutex, Packet, 8>,
}

impl MockBus {
    pub(crate) fn new() -> Self {
        Self {
            to_host: Channel::new(),
            from_host: Channel::new(),
        }
    }

    pub(crate) fn driver(&self) -> MockDriver<'_> {
        MockDriver { bus: self }
    }

    /// Deliver a packet as if the controller had sent it.
    pub(crate) async fn inject(&self, kind: HciMessageType, bytes: &[u8]) {
        self.to_host.send((kind, Vec::from_slice(bytes).unwrap())).await;
    }

    /// The next packet the layer handed to the transport.
    pub(crate) async fn sent(&self) -> Packet {
        self.from_host.receive().await
    }
}

pub(crate) struct MockDriver<'a> {
    bus: &'a MockBus,
}

impl HciDriver for MockDriver<'_> {
    type Error = core::convert::Infallible;

    async fn read(&mut self, buf: &mut [u8]) -> Result<HciMessageType, Self::Error> {
        let (kind, bytes) = self.bus.to_host.receive().await;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(kind)
    }

    async fn write(&mut self, kind: HciMessageType, data: &[u8]) -> Result<(), Self::Error> {
        self.bus.from_host.send((kind, Vec::from_slice(data).unwrap())).await;
        Ok(())
    }
}
