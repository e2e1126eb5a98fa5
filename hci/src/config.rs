//! Compile-time configuration.
//!
//! Sizing of the internal queues and tables. These are deliberately plain
//! constants: every queue in this crate is statically allocated, so the
//! numbers below directly determine the memory footprint of [`HciLayer`].
//!
//! [`HciLayer`]: crate::HciLayer

use embassy_time::Duration;

/// Maximum number of commands that can be queued (and therefore the number
/// of responses that can be pending consumption) at any one time.
///
/// Default: 8.
pub const COMMAND_QUEUE_SIZE: usize = 8;

/// How long to wait for the controller to answer an outstanding command
/// before declaring it dead.
///
/// Default: 2000 ms, the conventional value for kernel-backed transports.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Capacity of the event handler table.
///
/// Default: 32.
pub const EVENT_HANDLER_SLOTS: usize = 32;

/// Capacity of the LE subevent handler table.
///
/// Default: 24.
pub const LE_EVENT_HANDLER_SLOTS: usize = 24;

/// Depth of the outbound and inbound ACL queues.
///
/// Default: 3.
pub const ACL_QUEUE_DEPTH: usize = 3;

/// Largest HCI packet exchanged with the driver, excluding the packet
/// type indicator: an ACL packet with a 4 byte header and 255 bytes of
/// payload.
pub const MAX_HCI_PACKET_LEN: usize = 259;
