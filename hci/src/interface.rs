//! Domain-scoped command interfaces.
//!
//! Each subsystem above the layer (connection management, security,
//! advertising, scanning) obtains its own narrow handle for issuing
//! commands. Acquiring a handle also installs the caller's event handler
//! for the fixed set of codes that subsystem is responsible for, so a
//! subsystem cannot issue commands without also having its events routed.
//!
//! A handle only accepts the commands of its own domain: typed commands
//! are restricted at compile time through [`DomainCommand`], raw packets
//! at enqueue time against the domain's opcode table.

use core::marker::PhantomData;

use bt_hci::cmd::le::{
    LeAddDeviceToFilterAcceptList, LeClearAdvSets, LeClearFilterAcceptList, LeConnUpdate, LeCreateConn,
    LeCreateConnCancel, LeEnableEncryption, LeExtCreateConn, LeLongTermKeyRequestReply, LeReadFilterAcceptListSize,
    LeSetAdvData, LeSetAdvEnable, LeSetAdvParams, LeSetAdvSetRandomAddr, LeSetDataLength, LeSetExtAdvData,
    LeSetExtAdvEnable, LeSetExtAdvParams, LeSetExtScanEnable, LeSetExtScanParams, LeSetExtScanResponseData,
    LeSetPhy, LeSetRandomAddr, LeSetScanEnable, LeSetScanParams, LeSetScanResponseData,
};
use bt_hci::cmd::link_control::Disconnect;
use bt_hci::cmd::{AsyncCmd, SyncCmd};
use bt_hci::WriteHci;

use crate::command::{CommandPacket, PendingResponse};
use crate::event::{EventCode, EventHandler, SubeventCode};
use crate::{Error, HciLayer};

/// Classic connection events routed to the ACL connection interface.
pub const ACL_CONNECTION_EVENTS: &[EventCode] = &[
    EventCode::CONNECTION_COMPLETE,
    EventCode::CONNECTION_REQUEST,
    EventCode::DISCONNECTION_COMPLETE,
    EventCode::AUTHENTICATION_COMPLETE,
    EventCode::READ_REMOTE_SUPPORTED_FEATURES_COMPLETE,
    EventCode::READ_REMOTE_EXTENDED_FEATURES_COMPLETE,
    EventCode::READ_REMOTE_VERSION_INFORMATION_COMPLETE,
    EventCode::QOS_SETUP_COMPLETE,
    EventCode::ROLE_CHANGE,
    EventCode::MODE_CHANGE,
    EventCode::READ_CLOCK_OFFSET_COMPLETE,
    EventCode::CONNECTION_PACKET_TYPE_CHANGED,
    EventCode::FLOW_SPECIFICATION_COMPLETE,
    EventCode::LINK_SUPERVISION_TIMEOUT_CHANGED,
];

/// LE subevents routed to the LE ACL connection interface.
pub const LE_CONNECTION_EVENTS: &[SubeventCode] = &[
    SubeventCode::CONNECTION_COMPLETE,
    SubeventCode::ENHANCED_CONNECTION_COMPLETE,
    SubeventCode::CONNECTION_UPDATE_COMPLETE,
    SubeventCode::READ_REMOTE_FEATURES_COMPLETE,
    SubeventCode::REMOTE_CONNECTION_PARAMETER_REQUEST,
    SubeventCode::DATA_LENGTH_CHANGE,
    SubeventCode::PHY_UPDATE_COMPLETE,
];

/// Classic pairing and encryption events routed to the security interface.
pub const SECURITY_EVENTS: &[EventCode] = &[
    EventCode::ENCRYPTION_CHANGE,
    EventCode::CHANGE_CONNECTION_LINK_KEY_COMPLETE,
    EventCode::CENTRAL_LINK_KEY_COMPLETE,
    EventCode::RETURN_LINK_KEYS,
    EventCode::PIN_CODE_REQUEST,
    EventCode::LINK_KEY_REQUEST,
    EventCode::LINK_KEY_NOTIFICATION,
    EventCode::ENCRYPTION_KEY_REFRESH_COMPLETE,
    EventCode::IO_CAPABILITY_REQUEST,
    EventCode::IO_CAPABILITY_RESPONSE,
    EventCode::USER_CONFIRMATION_REQUEST,
    EventCode::USER_PASSKEY_REQUEST,
    EventCode::REMOTE_OOB_DATA_REQUEST,
    EventCode::SIMPLE_PAIRING_COMPLETE,
    EventCode::USER_PASSKEY_NOTIFICATION,
    EventCode::KEYPRESS_NOTIFICATION,
];

/// LE subevents routed to the LE security interface.
pub const LE_SECURITY_EVENTS: &[SubeventCode] = &[
    SubeventCode::LONG_TERM_KEY_REQUEST,
    SubeventCode::READ_LOCAL_P256_PUBLIC_KEY_COMPLETE,
    SubeventCode::GENERATE_DHKEY_COMPLETE,
];

/// LE subevents routed to the LE advertising interface.
pub const LE_ADVERTISING_EVENTS: &[SubeventCode] = &[
    SubeventCode::SCAN_REQUEST_RECEIVED,
    SubeventCode::ADVERTISING_SET_TERMINATED,
];

/// LE subevents routed to the LE scanning interface.
pub const LE_SCANNING_EVENTS: &[SubeventCode] = &[
    SubeventCode::ADVERTISING_REPORT,
    SubeventCode::DIRECTED_ADVERTISING_REPORT,
    SubeventCode::EXTENDED_ADVERTISING_REPORT,
    SubeventCode::SCAN_TIMEOUT,
];

/// Opcodes the ACL connection interface may enqueue: link control and
/// link policy commands for classic connections.
pub const ACL_CONNECTION_COMMANDS: &[u16] = &[
    0x0405, // Create Connection
    0x0406, // Disconnect
    0x0408, // Create Connection Cancel
    0x0409, // Accept Connection Request
    0x040a, // Reject Connection Request
    0x040f, // Change Connection Packet Type
    0x041b, // Read Remote Supported Features
    0x041c, // Read Remote Extended Features
    0x041d, // Read Remote Version Information
    0x041f, // Read Clock Offset
    0x0801, // Hold Mode
    0x0803, // Sniff Mode
    0x0804, // Exit Sniff Mode
    0x0807, // QoS Setup
    0x0809, // Role Discovery
    0x080b, // Switch Role
    0x080c, // Read Link Policy Settings
    0x080d, // Write Link Policy Settings
    0x0810, // Flow Specification
    0x0811, // Sniff Subrating
];

/// Opcodes the LE ACL connection interface may enqueue.
pub const LE_CONNECTION_COMMANDS: &[u16] = &[
    0x0406, // Disconnect
    0x200d, // LE Create Connection
    0x200e, // LE Create Connection Cancel
    0x200f, // LE Read Filter Accept List Size
    0x2010, // LE Clear Filter Accept List
    0x2011, // LE Add Device To Filter Accept List
    0x2012, // LE Remove Device From Filter Accept List
    0x2013, // LE Connection Update
    0x2015, // LE Read Channel Map
    0x2016, // LE Read Remote Features
    0x2020, // LE Remote Connection Parameter Request Reply
    0x2021, // LE Remote Connection Parameter Request Negative Reply
    0x2022, // LE Set Data Length
    0x2030, // LE Read PHY
    0x2032, // LE Set PHY
    0x2043, // LE Extended Create Connection
];

/// Opcodes the security interface may enqueue: classic authentication,
/// link key and pairing commands.
pub const SECURITY_COMMANDS: &[u16] = &[
    0x040b, // Link Key Request Reply
    0x040c, // Link Key Request Negative Reply
    0x040d, // PIN Code Request Reply
    0x040e, // PIN Code Request Negative Reply
    0x0411, // Authentication Requested
    0x0413, // Set Connection Encryption
    0x0415, // Change Connection Link Key
    0x0417, // Central Link Key
    0x042b, // IO Capability Request Reply
    0x042c, // User Confirmation Request Reply
    0x042d, // User Confirmation Request Negative Reply
    0x042e, // User Passkey Request Reply
    0x042f, // User Passkey Request Negative Reply
    0x0430, // Remote OOB Data Request Reply
    0x0433, // Remote OOB Data Request Negative Reply
    0x0434, // IO Capability Request Negative Reply
];

/// Opcodes the LE security interface may enqueue.
pub const LE_SECURITY_COMMANDS: &[u16] = &[
    0x2017, // LE Encrypt
    0x2018, // LE Rand
    0x2019, // LE Enable Encryption
    0x201a, // LE Long Term Key Request Reply
    0x201b, // LE Long Term Key Request Negative Reply
    0x2025, // LE Read Local P-256 Public Key
    0x2026, // LE Generate DHKey
];

/// Opcodes the LE advertising interface may enqueue.
pub const LE_ADVERTISING_COMMANDS: &[u16] = &[
    0x2005, // LE Set Random Address
    0x2006, // LE Set Advertising Parameters
    0x2007, // LE Read Advertising Physical Channel Tx Power
    0x2008, // LE Set Advertising Data
    0x2009, // LE Set Scan Response Data
    0x200a, // LE Set Advertising Enable
    0x2035, // LE Set Advertising Set Random Address
    0x2036, // LE Set Extended Advertising Parameters
    0x2037, // LE Set Extended Advertising Data
    0x2038, // LE Set Extended Scan Response Data
    0x2039, // LE Set Extended Advertising Enable
    0x203a, // LE Read Maximum Advertising Data Length
    0x203b, // LE Read Number of Supported Advertising Sets
    0x203c, // LE Remove Advertising Set
    0x203d, // LE Clear Advertising Sets
];

/// Opcodes the LE scanning interface may enqueue.
pub const LE_SCANNING_COMMANDS: &[u16] = &[
    0x200b, // LE Set Scan Parameters
    0x200c, // LE Set Scan Enable
    0x2041, // LE Set Extended Scan Parameters
    0x2042, // LE Set Extended Scan Enable
];

/// Classic ACL connection management.
pub enum AclConnection {}
/// LE connection management.
pub enum LeAclConnection {}
/// Classic pairing and encryption.
pub enum Security {}
/// LE encryption and key generation.
pub enum LeSecurity {}
/// LE advertising control.
pub enum LeAdvertising {}
/// LE scanning control.
pub enum LeScanning {}

/// A command domain served by one of the layer's interfaces.
pub trait Domain {
    /// Opcodes of the commands belonging to this domain.
    const COMMANDS: &'static [u16];
}

impl Domain for AclConnection {
    const COMMANDS: &'static [u16] = ACL_CONNECTION_COMMANDS;
}

impl Domain for LeAclConnection {
    const COMMANDS: &'static [u16] = LE_CONNECTION_COMMANDS;
}

impl Domain for Security {
    const COMMANDS: &'static [u16] = SECURITY_COMMANDS;
}

impl Domain for LeSecurity {
    const COMMANDS: &'static [u16] = LE_SECURITY_COMMANDS;
}

impl Domain for LeAdvertising {
    const COMMANDS: &'static [u16] = LE_ADVERTISING_COMMANDS;
}

impl Domain for LeScanning {
    const COMMANDS: &'static [u16] = LE_SCANNING_COMMANDS;
}

mod sealed {
    pub trait Sealed {}
}

/// A typed command accepted by the interface of domain `K`.
///
/// Commands from another domain do not satisfy the bound and are rejected
/// at compile time:
///
/// ```compile_fail
/// use bt_hci::cmd::le::LeEnableEncryption;
/// use bt_hci::param::ConnHandle;
/// use hci_layer::event::{EventHandler, EventPacket};
/// use hci_layer::HciLayer;
///
/// struct NoEvents;
/// impl EventHandler for NoEvents {
///     fn on_event(&self, _event: &EventPacket) {}
/// }
///
/// let handler = NoEvents;
/// let layer = HciLayer::new();
/// let scanning = layer.le_scanning_interface(&handler);
/// // An LE security command does not go through the scanning interface.
/// let _ = scanning.async_command(&LeEnableEncryption::new(ConnHandle::new(0), [0; 8], 0, [0; 16]));
/// ```
pub trait DomainCommand<K>: sealed::Sealed {}

macro_rules! sealed_commands {
    ($($cmd:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $cmd {}
        )*
    };
}

sealed_commands!(
    Disconnect,
    LeAddDeviceToFilterAcceptList,
    LeClearAdvSets,
    LeClearFilterAcceptList,
    LeConnUpdate,
    LeCreateConn,
    LeCreateConnCancel,
    LeEnableEncryption,
    LeExtCreateConn,
    LeLongTermKeyRequestReply,
    LeReadFilterAcceptListSize,
    LeSetAdvData,
    LeSetAdvEnable,
    LeSetAdvParams,
    LeSetAdvSetRandomAddr,
    LeSetDataLength,
    LeSetExtAdvData<'_>,
    LeSetExtAdvEnable<'_>,
    LeSetExtAdvParams,
    LeSetExtScanEnable,
    LeSetExtScanParams,
    LeSetExtScanResponseData<'_>,
    LeSetPhy,
    LeSetRandomAddr,
    LeSetScanEnable,
    LeSetScanParams,
    LeSetScanResponseData,
);

macro_rules! domain_commands {
    ($($domain:ty => [$($cmd:ty),* $(,)?];)+) => {
        $($(
            impl DomainCommand<$domain> for $cmd {}
        )*)+
    };
}

// The classic security command set has no typed builders in `bt-hci`;
// the security interface is served by the raw enqueue operations.
domain_commands! {
    AclConnection => [Disconnect];
    LeAclConnection => [
        Disconnect,
        LeCreateConn,
        LeCreateConnCancel,
        LeExtCreateConn,
        LeConnUpdate,
        LeReadFilterAcceptListSize,
        LeClearFilterAcceptList,
        LeAddDeviceToFilterAcceptList,
        LeSetDataLength,
        LeSetPhy,
    ];
    LeSecurity => [LeEnableEncryption, LeLongTermKeyRequestReply];
    LeAdvertising => [
        LeSetRandomAddr,
        LeSetAdvParams,
        LeSetAdvData,
        LeSetScanResponseData,
        LeSetAdvEnable,
        LeSetAdvSetRandomAddr,
        LeSetExtAdvParams,
        LeSetExtAdvData<'_>,
        LeSetExtScanResponseData<'_>,
        LeSetExtAdvEnable<'_>,
        LeClearAdvSets,
    ];
    LeScanning => [LeSetScanParams, LeSetScanEnable, LeSetExtScanParams, LeSetExtScanEnable];
}

/// A command handle scoped to one subsystem domain `K`.
///
/// The handle only accepts its own domain's commands: typed commands must
/// implement [`DomainCommand<K>`], and raw packets are checked against
/// [`Domain::COMMANDS`] when enqueued. Interfaces borrow the layer and may
/// be freely recreated; the event registrations made when the interface
/// was acquired stay in place.
pub struct CommandInterface<'d, K> {
    hci: &'d HciLayer<'d>,
    _domain: PhantomData<K>,
}

/// Command handle for classic ACL connection management.
pub type AclConnectionInterface<'d> = CommandInterface<'d, AclConnection>;
/// Command handle for LE connection management.
pub type LeAclConnectionInterface<'d> = CommandInterface<'d, LeAclConnection>;
/// Command handle for classic security.
pub type SecurityInterface<'d> = CommandInterface<'d, Security>;
/// Command handle for LE security.
pub type LeSecurityInterface<'d> = CommandInterface<'d, LeSecurity>;
/// Command handle for LE advertising.
pub type LeAdvertisingInterface<'d> = CommandInterface<'d, LeAdvertising>;
/// Command handle for LE scanning.
pub type LeScanningInterface<'d> = CommandInterface<'d, LeScanning>;

impl<'d, K: Domain> CommandInterface<'d, K> {
    fn new(hci: &'d HciLayer<'d>) -> Self {
        Self {
            hci,
            _domain: PhantomData,
        }
    }

    /// Queue a command of this domain whose result arrives in a Command
    /// Complete event.
    pub fn command<C>(&self, cmd: &C) -> Result<PendingResponse<'d>, Error>
    where
        C: SyncCmd + WriteHci + DomainCommand<K>,
    {
        self.hci.command(cmd)
    }

    /// Queue a command of this domain that is acknowledged with a Command
    /// Status event.
    pub fn async_command<C>(&self, cmd: &C) -> Result<PendingResponse<'d>, Error>
    where
        C: AsyncCmd + WriteHci + DomainCommand<K>,
    {
        self.hci.async_command(cmd)
    }

    /// Queue a pre-serialized command expecting a Command Complete.
    ///
    /// Panics if the packet's opcode does not belong to this domain.
    pub fn enqueue_for_complete(&self, packet: CommandPacket) -> Result<PendingResponse<'d>, Error> {
        self.check_domain(&packet);
        self.hci.enqueue_for_complete(packet)
    }

    /// Queue a pre-serialized command expecting a Command Status.
    ///
    /// Panics if the packet's opcode does not belong to this domain.
    pub fn enqueue_for_status(&self, packet: CommandPacket) -> Result<PendingResponse<'d>, Error> {
        self.check_domain(&packet);
        self.hci.enqueue_for_status(packet)
    }

    fn check_domain(&self, packet: &CommandPacket) {
        let opcode = packet.opcode();
        if !K::COMMANDS.contains(&opcode) {
            panic!("opcode {:04x} is outside this command interface's domain", opcode);
        }
    }
}

impl<'d> HciLayer<'d> {
    /// Acquire the classic ACL connection interface. `handler` receives
    /// the events in [`ACL_CONNECTION_EVENTS`].
    pub fn acl_connection_interface(&'d self, handler: &'d dyn EventHandler) -> AclConnectionInterface<'d> {
        for code in ACL_CONNECTION_EVENTS {
            self.register_event_handler(*code, handler);
        }
        CommandInterface::new(self)
    }

    /// Acquire the LE ACL connection interface. `handler` receives the
    /// subevents in [`LE_CONNECTION_EVENTS`].
    pub fn le_acl_connection_interface(&'d self, handler: &'d dyn EventHandler) -> LeAclConnectionInterface<'d> {
        for subevent in LE_CONNECTION_EVENTS {
            self.register_le_event_handler(*subevent, handler);
        }
        CommandInterface::new(self)
    }

    /// Acquire the security interface. `handler` receives the events in
    /// [`SECURITY_EVENTS`].
    pub fn security_interface(&'d self, handler: &'d dyn EventHandler) -> SecurityInterface<'d> {
        for code in SECURITY_EVENTS {
            self.register_event_handler(*code, handler);
        }
        CommandInterface::new(self)
    }

    /// Acquire the LE security interface. `handler` receives the
    /// subevents in [`LE_SECURITY_EVENTS`].
    pub fn le_security_interface(&'d self, handler: &'d dyn EventHandler) -> LeSecurityInterface<'d> {
        for subevent in LE_SECURITY_EVENTS {
            self.register_le_event_handler(*subevent, handler);
        }
        CommandInterface::new(self)
    }

    /// Acquire the LE advertising interface. `handler` receives the
    /// subevents in [`LE_ADVERTISING_EVENTS`].
    pub fn le_advertising_interface(&'d self, handler: &'d dyn EventHandler) -> LeAdvertisingInterface<'d> {
        for subevent in LE_ADVERTISING_EVENTS {
            self.register_le_event_handler(*subevent, handler);
        }
        CommandInterface::new(self)
    }

    /// Acquire the LE scanning interface. `handler` receives the
    /// subevents in [`LE_SCANNING_EVENTS`].
    pub fn le_scanning_interface(&'d self, handler: &'d dyn EventHandler) -> LeScanningInterface<'d> {
        for subevent in LE_SCANNING_EVENTS {
            self.register_le_event_handler(*subevent, handler);
        }
        CommandInterface::new(self)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::Cell;
    use core::task::Poll;

    use bt_hci::param::ConnHandle;
    use embassy_futures::poll_once;

    use super::*;
    use crate::event::EventPacket;

    struct Counter(Cell<usize>);

    impl Counter {
        fn new() -> Self {
            Self(Cell::new(0))
        }
    }

    impl EventHandler for Counter {
        fn on_event(&self, _event: &EventPacket) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn acquiring_an_interface_routes_its_events() {
        let handler = Counter::new();
        let layer = HciLayer::new();
        let _interface = layer.acl_connection_interface(&handler);

        let event = EventPacket::new(EventCode::CONNECTION_COMPLETE, &[0x00]).unwrap();
        layer.events.dispatch(&event);
        assert_eq!(handler.0.get(), 1);

        // Codes outside the interface's set are unaffected.
        let event = EventPacket::new(EventCode::INQUIRY_COMPLETE, &[0x00]).unwrap();
        layer.events.dispatch(&event);
        assert_eq!(handler.0.get(), 1);
    }

    #[test]
    fn le_interfaces_route_subevents() {
        let handler = Counter::new();
        let layer = HciLayer::new();
        let _interface = layer.le_acl_connection_interface(&handler);

        let event = EventPacket::new(EventCode::LE_META_EVENT, &[0x0a, 0x00]).unwrap();
        layer.events.dispatch_le(&event);
        assert_eq!(handler.0.get(), 1);
    }

    #[test]
    #[should_panic(expected = "second handler")]
    fn acquiring_an_interface_twice_is_fatal() {
        let handler = Counter::new();
        let layer = HciLayer::new();
        let _first = layer.le_scanning_interface(&handler);
        let _second = layer.le_scanning_interface(&handler);
    }

    #[test]
    fn interfaces_feed_the_shared_command_queue() {
        let handler = Counter::new();
        let le_handler = Counter::new();
        let layer = HciLayer::new();
        let scanning = layer.le_scanning_interface(&handler);
        let security = layer.le_security_interface(&le_handler);

        let _scan = scanning.command(&LeSetScanEnable::new(true, false)).unwrap();
        let _encrypt = security
            .async_command(&LeEnableEncryption::new(ConnHandle::new(0x0040), [0; 8], 0, [0; 16]))
            .unwrap();

        let granted = poll_once(layer.commands.next_send());
        assert!(matches!(granted, Poll::Ready(ref p) if p.opcode() == 0x200c));
    }

    #[test]
    fn raw_packets_within_the_domain_are_accepted() {
        let handler = Counter::new();
        let layer = HciLayer::new();
        let security = layer.security_interface(&handler);

        // Authentication Requested, a classic security command.
        let _pending = security
            .enqueue_for_status(CommandPacket::new(0x0411, &[0x40, 0x00]).unwrap())
            .unwrap();

        let granted = poll_once(layer.commands.next_send());
        assert!(matches!(granted, Poll::Ready(ref p) if p.opcode() == 0x0411));
    }

    #[test]
    #[should_panic(expected = "outside this command interface's domain")]
    fn raw_packets_from_another_domain_are_rejected() {
        let handler = Counter::new();
        let layer = HciLayer::new();
        let scanning = layer.le_scanning_interface(&handler);

        // Authentication Requested does not go through the scanning
        // interface.
        let _ = scanning.enqueue_for_status(CommandPacket::new(0x0411, &[0x40, 0x00]).unwrap());
    }
}
