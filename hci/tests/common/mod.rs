use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;
use hci_layer::driver::{HciDriver, HciMessageType};

pub const MAX_PACKET: usize = 259;

pub type Packet = (HciMessageType, Vec<u8, MAX_PACKET>);

/// A fake transport: tests play the controller role on one side while the
/// layer under test drives the other.
pub struct TestBus {
    to_host: Channel<NoopRawMutex, Packet, 8>,
    from_host: Channel<NoopRawMutex, Packet, 8>,
}

impl TestBus {
    pub fn new() -> &'static TestBus {
        Box::leak(Box::new(TestBus {
            to_host: Channel::new(),
            from_host: Channel::new(),
        }))
    }

    pub fn driver(&'static self) -> TestDriver {
        TestDriver { bus: self }
    }

    /// Deliver a packet as if the controller had sent it.
    pub async fn inject(&self, kind: HciMessageType, bytes: &[u8]) {
        self.to_host.send((kind, Vec::from_slice(bytes).unwrap())).await;
    }

    pub async fn inject_command_complete(&self, opcode: u16, credits: u8, return_params: &[u8]) {
        let mut bytes = vec![0x0e, 3 + return_params.len() as u8, credits, opcode as u8, (opcode >> 8) as u8];
        bytes.extend_from_slice(return_params);
        self.inject(HciMessageType::Event, &bytes).await;
    }

    pub async fn inject_command_status(&self, opcode: u16, credits: u8, status: u8) {
        self.inject(
            HciMessageType::Event,
            &[0x0f, 0x04, status, credits, opcode as u8, (opcode >> 8) as u8],
        )
        .await;
    }

    /// The next packet the layer handed to the transport.
    pub async fn sent(&self) -> Packet {
        self.from_host.receive().await
    }

    /// The next transmitted packet, asserted to be a command; returns its
    /// opcode and raw bytes.
    pub async fn expect_command(&self) -> (u16, Vec<u8, MAX_PACKET>) {
        let (kind, bytes) = self.sent().await;
        assert_eq!(kind, HciMessageType::Command);
        (u16::from_le_bytes([bytes[0], bytes[1]]), bytes)
    }
}

pub struct TestDriver {
    bus: &'static TestBus,
}

impl HciDriver for TestDriver {
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
