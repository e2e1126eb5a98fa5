//! HCI event packets and the demultiplexer tables that route them.

use core::cell::RefCell;

use heapless::Vec;

use crate::config;
use crate::Error;

/// Event packet header: event code and parameter length.
const EVT_HDR: usize = 2;
const EVT_BUF: usize = EVT_HDR + u8::MAX as usize;

/// An HCI event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct EventCode(u8);

impl EventCode {
    /// Create an event code from its raw value.
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw value of the event code.
    pub const fn to_raw(self) -> u8 {
        self.0
    }
}

macro_rules! event_codes {
    ($($(#[$doc:meta])* ($name:ident, $value:expr);)+) => {
        impl EventCode {
            $(
                $(#[$doc])*
                pub const $name: EventCode = EventCode($value);
            )+
        }
    };
}

event_codes! {
    /// Inquiry Complete.
    (INQUIRY_COMPLETE, 0x01);
    /// Inquiry Result.
    (INQUIRY_RESULT, 0x02);
    /// Connection Complete.
    (CONNECTION_COMPLETE, 0x03);
    /// Connection Request.
    (CONNECTION_REQUEST, 0x04);
    /// Disconnection Complete.
    (DISCONNECTION_COMPLETE, 0x05);
    /// Authentication Complete.
    (AUTHENTICATION_COMPLETE, 0x06);
    /// Remote Name Request Complete.
    (REMOTE_NAME_REQUEST_COMPLETE, 0x07);
    /// Encryption Change.
    (ENCRYPTION_CHANGE, 0x08);
    /// Change Connection Link Key Complete.
    (CHANGE_CONNECTION_LINK_KEY_COMPLETE, 0x09);
    /// Central Link Key Complete.
    (CENTRAL_LINK_KEY_COMPLETE, 0x0a);
    /// Read Remote Supported Features Complete.
    (READ_REMOTE_SUPPORTED_FEATURES_COMPLETE, 0x0b);
    /// Read Remote Version Information Complete.
    (READ_REMOTE_VERSION_INFORMATION_COMPLETE, 0x0c);
    /// QoS Setup Complete.
    (QOS_SETUP_COMPLETE, 0x0d);
    /// Command Complete.
    (COMMAND_COMPLETE, 0x0e);
    /// Command Status.
    (COMMAND_STATUS, 0x0f);
    /// Hardware Error.
    (HARDWARE_ERROR, 0x10);
    /// Flush Occurred.
    (FLUSH_OCCURRED, 0x11);
    /// Role Change.
    (ROLE_CHANGE, 0x12);
    /// Number Of Completed Packets.
    (NUMBER_OF_COMPLETED_PACKETS, 0x13);
    /// Mode Change.
    (MODE_CHANGE, 0x14);
    /// Return Link Keys.
    (RETURN_LINK_KEYS, 0x15);
    /// PIN Code Request.
    (PIN_CODE_REQUEST, 0x16);
    /// Link Key Request.
    (LINK_KEY_REQUEST, 0x17);
    /// Link Key Notification.
    (LINK_KEY_NOTIFICATION, 0x18);
    /// Loopback Command.
    (LOOPBACK_COMMAND, 0x19);
    /// Data Buffer Overflow.
    (DATA_BUFFER_OVERFLOW, 0x1a);
    /// Max Slots Change.
    (MAX_SLOTS_CHANGE, 0x1b);
    /// Read Clock Offset Complete.
    (READ_CLOCK_OFFSET_COMPLETE, 0x1c);
    /// Connection Packet Type Changed.
    (CONNECTION_PACKET_TYPE_CHANGED, 0x1d);
    /// QoS Violation.
    (QOS_VIOLATION, 0x1e);
    /// Page Scan Repetition Mode Change.
    (PAGE_SCAN_REPETITION_MODE_CHANGE, 0x20);
    /// Flow Specification Complete.
    (FLOW_SPECIFICATION_COMPLETE, 0x21);
    /// Inquiry Result with RSSI.
    (INQUIRY_RESULT_WITH_RSSI, 0x22);
    /// Read Remote Extended Features Complete.
    (READ_REMOTE_EXTENDED_FEATURES_COMPLETE, 0x23);
    /// Synchronous Connection Complete.
    (SYNCHRONOUS_CONNECTION_COMPLETE, 0x2c);
    /// Synchronous Connection Changed.
    (SYNCHRONOUS_CONNECTION_CHANGED, 0x2d);
    /// Sniff Subrating.
    (SNIFF_SUBRATING, 0x2e);
    /// Extended Inquiry Result.
    (EXTENDED_INQUIRY_RESULT, 0x2f);
    /// Encryption Key Refresh Complete.
    (ENCRYPTION_KEY_REFRESH_COMPLETE, 0x30);
    /// IO Capability Request.
    (IO_CAPABILITY_REQUEST, 0x31);
    /// IO Capability Response.
    (IO_CAPABILITY_RESPONSE, 0x32);
    /// User Confirmation Request.
    (USER_CONFIRMATION_REQUEST, 0x33);
    /// User Passkey Request.
    (USER_PASSKEY_REQUEST, 0x34);
    /// Remote OOB Data Request.
    (REMOTE_OOB_DATA_REQUEST, 0x35);
    /// Simple Pairing Complete.
    (SIMPLE_PAIRING_COMPLETE, 0x36);
    /// Link Supervision Timeout Changed.
    (LINK_SUPERVISION_TIMEOUT_CHANGED, 0x38);
    /// Enhanced Flush Complete.
    (ENHANCED_FLUSH_COMPLETE, 0x39);
    /// User Passkey Notification.
    (USER_PASSKEY_NOTIFICATION, 0x3b);
    /// Keypress Notification.
    (KEYPRESS_NOTIFICATION, 0x3c);
    /// Remote Host Supported Features Notification.
    (REMOTE_HOST_SUPPORTED_FEATURES_NOTIFICATION, 0x3d);
    /// LE Meta event. The first parameter octet carries the subevent code.
    (LE_META_EVENT, 0x3e);
    /// Vendor Specific.
    (VENDOR_SPECIFIC, 0xff);
}

/// An LE Meta event subevent code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct SubeventCode(u8);

impl SubeventCode {
    /// Create a subevent code from its raw value.
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw value of the subevent code.
    pub const fn to_raw(self) -> u8 {
        self.0
    }
}

macro_rules! subevent_codes {
    ($($(#[$doc:meta])* ($name:ident, $value:expr);)+) => {
        impl SubeventCode {
            $(
                $(#[$doc])*
                pub const $name: SubeventCode = SubeventCode($value);
            )+
        }
    };
}

subevent_codes! {
    /// LE Connection Complete.
    (CONNECTION_COMPLETE, 0x01);
    /// LE Advertising Report.
    (ADVERTISING_REPORT, 0x02);
    /// LE Connection Update Complete.
    (CONNECTION_UPDATE_COMPLETE, 0x03);
    /// LE Read Remote Features Complete.
    (READ_REMOTE_FEATURES_COMPLETE, 0x04);
    /// LE Long Term Key Request.
    (LONG_TERM_KEY_REQUEST, 0x05);
    /// LE Remote Connection Parameter Request.
    (REMOTE_CONNECTION_PARAMETER_REQUEST, 0x06);
    /// LE Data Length Change.
    (DATA_LENGTH_CHANGE, 0x07);
    /// LE Read Local P-256 Public Key Complete.
    (READ_LOCAL_P256_PUBLIC_KEY_COMPLETE, 0x08);
    /// LE Generate DHKey Complete.
    (GENERATE_DHKEY_COMPLETE, 0x09);
    /// LE Enhanced Connection Complete.
    (ENHANCED_CONNECTION_COMPLETE, 0x0a);
    /// LE Directed Advertising Report.
    (DIRECTED_ADVERTISING_REPORT, 0x0b);
    /// LE PHY Update Complete.
    (PHY_UPDATE_COMPLETE, 0x0c);
    /// LE Extended Advertising Report.
    (EXTENDED_ADVERTISING_REPORT, 0x0d);
    /// LE Periodic Advertising Sync Established.
    (PERIODIC_ADVERTISING_SYNC_ESTABLISHED, 0x0e);
    /// LE Periodic Advertising Report.
    (PERIODIC_ADVERTISING_REPORT, 0x0f);
    /// LE Periodic Advertising Sync Lost.
    (PERIODIC_ADVERTISING_SYNC_LOST, 0x10);
    /// LE Scan Timeout.
    (SCAN_TIMEOUT, 0x11);
    /// LE Advertising Set Terminated.
    (ADVERTISING_SET_TERMINATED, 0x12);
    /// LE Scan Request Received.
    (SCAN_REQUEST_RECEIVED, 0x13);
    /// LE Channel Selection Algorithm.
    (CHANNEL_SELECTION_ALGORITHM, 0x14);
}

/// An owned, validated HCI event packet.
///
/// The layer only interprets the event code, the subevent code of LE Meta
/// events, and the fields of the two command response events; everything
/// else is carried opaquely for handlers to decode with their packet
/// library of choice.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventPacket {
    bytes: Vec<u8, EVT_BUF>,
}

impl EventPacket {
    /// Build an event packet from an event code and parameter bytes.
    pub fn new(code: EventCode, params: &[u8]) -> Result<Self, Error> {
        if params.len() > u8::MAX as usize {
            return Err(Error::InvalidPacket);
        }
        let mut bytes = Vec::new();
        unwrap!(bytes.push(code.to_raw()));
        unwrap!(bytes.push(params.len() as u8));
        unwrap!(bytes.extend_from_slice(params));
        Ok(Self { bytes })
    }

    /// Parse an event packet from raw bytes as delivered by the driver.
    ///
    /// `data` may extend past the end of the packet (the driver hands over
    /// a fixed receive buffer); anything beyond the encoded parameter
    /// length is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < EVT_HDR {
            return Err(Error::InvalidPacket);
        }
        let total = EVT_HDR + data[1] as usize;
        if data.len() < total {
            return Err(Error::InvalidPacket);
        }
        let bytes = unwrap!(Vec::from_slice(&data[..total]));
        Ok(Self { bytes })
    }

    /// The event code.
    pub fn code(&self) -> EventCode {
        EventCode(self.bytes[0])
    }

    /// The event parameters.
    pub fn params(&self) -> &[u8] {
        &self.bytes[EVT_HDR..]
    }

    /// The subevent code, if this is an LE Meta event with a non-empty
    /// payload.
    pub fn subevent_code(&self) -> Option<SubeventCode> {
        if self.code() != EventCode::LE_META_EVENT {
            return None;
        }
        self.params().first().copied().map(SubeventCode)
    }

    /// The full packet, header included, as it appeared on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A repeated-delivery event callback.
///
/// Handlers are invoked once per matching event, in controller delivery
/// order, from the layer's run loop. They must not re-enter the layer's
/// registration methods.
pub trait EventHandler {
    /// Called with every event routed to this handler.
    fn on_event(&self, event: &EventPacket);
}

/// Handler for event codes the controller is known to emit but nobody
/// consumes. Registered so the events are not logged as unexpected.
pub(crate) struct DropEvent;

impl EventHandler for DropEvent {
    fn on_event(&self, _event: &EventPacket) {}
}

pub(crate) struct EventRegistry<'d> {
    handlers: RefCell<Vec<(EventCode, &'d dyn EventHandler), { config::EVENT_HANDLER_SLOTS }>>,
    le_handlers: RefCell<Vec<(SubeventCode, &'d dyn EventHandler), { config::LE_EVENT_HANDLER_SLOTS }>>,
}

impl<'d> EventRegistry<'d> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            le_handlers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, code: EventCode, handler: &'d dyn EventHandler) {
        let mut handlers = self.handlers.borrow_mut();
        if handlers.iter().any(|(c, _)| *c == code) {
            panic!("cannot register a second handler for event code {:?}", code);
        }
        if handlers.push((code, handler)).is_err() {
            panic!("event handler table exhausted");
        }
    }

    pub(crate) fn unregister(&self, code: EventCode) {
        let mut handlers = self.handlers.borrow_mut();
        match handlers.iter().position(|(c, _)| *c == code) {
            Some(idx) => {
                handlers.swap_remove(idx);
            }
            None => panic!("no handler registered for event code {:?}", code),
        }
    }

    pub(crate) fn register_le(&self, subevent: SubeventCode, handler: &'d dyn EventHandler) {
        let mut handlers = self.le_handlers.borrow_mut();
        if handlers.iter().any(|(c, _)| *c == subevent) {
            panic!("cannot register a second handler for subevent code {:?}", subevent);
        }
        if handlers.push((subevent, handler)).is_err() {
            panic!("le subevent handler table exhausted");
        }
    }

    pub(crate) fn unregister_le(&self, subevent: SubeventCode) {
        let mut handlers = self.le_handlers.borrow_mut();
        match handlers.iter().position(|(c, _)| *c == subevent) {
            Some(idx) => {
                handlers.swap_remove(idx);
            }
            None => panic!("no handler registered for subevent code {:?}", subevent),
        }
    }

    /// Route an ordinary event to its handler, or drop it.
    pub(crate) fn dispatch(&self, event: &EventPacket) {
        let code = event.code();
        // The handler reference is copied out so the table is not borrowed
        // while the handler runs.
        let handler = self.handlers.borrow().iter().find(|(c, _)| *c == code).map(|(_, h)| *h);
        match handler {
            Some(handler) => handler.on_event(event),
            None => debug!("[hci] dropping unregistered event {:?}", code),
        }
    }

    /// Route an LE Meta event to its subevent handler.
    ///
    /// Every LE subevent the controller has been told to report must have a
    /// handler; a missing one means event masks and registrations disagree.
    pub(crate) fn dispatch_le(&self, event: &EventPacket) {
        let Some(subevent) = event.subevent_code() else {
            panic!("le meta event without a subevent code");
        };
        let handler = self
            .le_handlers
            .borrow()
            .iter()
            .find(|(c, _)| *c == subevent)
            .map(|(_, h)| *h);
        match handler {
            Some(handler) => handler.on_event(event),
            None => panic!("unhandled le subevent {:?}", subevent),
        }
    }
}
