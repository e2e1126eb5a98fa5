//! The driver seam between this crate and the transport that carries HCI
//! bytes to the controller (UART, USB, IPC, a kernel device node, ...).

pub use embedded_io::ErrorKind;

/// This trait allows generic code to do limited inspecting of errors,
/// to react differently to different kinds.
pub trait Error: core::fmt::Debug {
    /// Get the kind of this error.
    fn kind(&self) -> ErrorKind;
}

impl Error for core::convert::Infallible {
    fn kind(&self) -> ErrorKind {
        match *self {}
    }
}

impl Error for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

/// The kind of an HCI packet, as named on the wire by the packet type
/// indicator octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HciMessageType {
    /// Host to controller command packet.
    Command = 0x01,
    /// ACL data packet, either direction.
    AclData = 0x02,
    /// Synchronous (SCO) data packet, either direction.
    SyncData = 0x03,
    /// Controller to host event packet.
    Event = 0x04,
}

/// Interface to a driver for an HCI transport.
///
/// The driver is responsible for packet framing only; it does not inspect
/// packet contents beyond what framing requires.
pub trait HciDriver {
    /// Driver error type.
    type Error: Error;

    /// Reads an entire HCI packet into the provided buffer.
    ///
    /// If successful, returns the message type of the received HCI packet.
    /// The packet contents (header plus payload, without the packet type
    /// indicator) are placed at the start of `buf`.
    ///
    /// This future is raced against other work, so losing a packet when the
    /// future is dropped is not acceptable: implementations must be
    /// cancel-safe.
    async fn read(&mut self, buf: &mut [u8]) -> Result<HciMessageType, Self::Error>;

    /// Write the provided data as a single HCI packet.
    async fn write(&mut self, kind: HciMessageType, data: &[u8]) -> Result<(), Self::Error>;
}
