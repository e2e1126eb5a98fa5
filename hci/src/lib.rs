//! Host-side core of the Bluetooth Host Controller Interface.
//!
//! This crate sits directly above a byte-level controller transport (a
//! UART, USB endpoint, IPC channel or kernel device, abstracted as an
//! [`HciDriver`](driver::HciDriver)) and multiplexes the three kinds of
//! HCI traffic over it:
//!
//! - a strictly serialized command channel with controller flow control:
//!   one command outstanding at a time, responses matched to the issuing
//!   command by opcode and response kind, and a hard deadline on a
//!   controller that stops answering,
//! - an event demultiplexer routing event codes and LE Meta subevent
//!   codes to registered handlers,
//! - a bidirectional ACL data path with bounded queues toward the upper
//!   layers.
//!
//! Everything runs on a single task driven by [`Runner::run`]; the public
//! operations never block and command responses resolve on the issuing
//! task. The first command on the wire is always HCI_Reset, and a
//! controller that violates the protocol (wrong opcode, wrong response
//! kind, a response with nothing outstanding, or silence past the
//! deadline) brings the layer down with a diagnostic rather than limping
//! along.
//!
//! Packet contents are opaque to this crate apart from the handful of
//! fields flow control needs; commands are built and responses decoded
//! with the `bt-hci` types by the layers above.

#![no_std]
#![warn(missing_docs)]

mod fmt;

pub mod acl;
pub mod command;
pub mod config;
pub mod driver;
pub mod event;
pub mod interface;
mod layer;

#[cfg(test)]
pub(crate) mod mock_driver;

pub use layer::{HciLayer, Runner};

/// Errors returned by the layer's public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The command queue is at capacity; retry after a pending response
    /// has been consumed.
    CommandQueueFull,
    /// The outbound ACL queue is at capacity.
    AclQueueFull,
    /// A packet does not match the wire format it claims.
    InvalidPacket,
    /// Insufficient space in the target buffer.
    InsufficientSpace,
}

/// Errors surfaced by [`Runner::run`].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciLayerError<E> {
    /// Error from the transport driver.
    Driver(E),
    /// Error from the layer itself.
    Hci(Error),
}

impl<E> From<Error> for HciLayerError<E> {
    fn from(error: Error) -> Self {
        Self::Hci(error)
    }
}

pub mod prelude {
    //! Convenience include of the most commonly used types.
    pub use crate::acl::{AclPacket, AclQueueEnd, BoundaryFlag, HostBroadcastFlag};
    pub use crate::command::{CommandPacket, CommandResponse, PendingResponse, ResponseKind};
    pub use crate::driver::{HciDriver, HciMessageType};
    pub use crate::event::{EventCode, EventHandler, EventPacket, SubeventCode};
    pub use crate::interface::{
        AclConnectionInterface, CommandInterface, Domain, DomainCommand, LeAclConnectionInterface,
        LeAdvertisingInterface, LeScanningInterface, LeSecurityInterface, SecurityInterface,
    };
    pub use crate::{Error, HciLayer, HciLayerError, Runner};
}
