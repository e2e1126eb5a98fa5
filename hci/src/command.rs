//! The serialized command channel to the controller.
//!
//! Commands are queued in arrival order and released to the transport one
//! at a time: a command is only sent when the controller has granted at
//! least one command credit and the response to the previous command has
//! been consumed. Responses are matched to the queue head by opcode, and
//! the response kind (Command Complete vs Command Status) must agree with
//! what the issuer declared at enqueue time. A controller that answers
//! out of order, with the wrong response kind, or not at all within
//! [`COMMAND_TIMEOUT`](crate::config::COMMAND_TIMEOUT) is considered
//! broken and the layer panics with a diagnostic naming the opcode.

use core::cell::RefCell;
use core::future::{poll_fn, Future};
use core::pin::Pin;
use core::task::{Context, Poll};

use bt_hci::cmd::Cmd;
use bt_hci::param::Status;
use bt_hci::{FromHciBytes, WriteHci};
use embassy_sync::waitqueue::WakerRegistration;
use embassy_time::Instant;
use heapless::{Deque, Vec};

use crate::config;
use crate::event::EventPacket;
use crate::Error;

/// Command packet header: opcode and parameter length.
const CMD_HDR: usize = 3;
const CMD_BUF: usize = CMD_HDR + u8::MAX as usize;

/// Opcode value a controller reports when it returns command credits
/// without answering a particular command.
pub const OPCODE_NONE: u16 = 0x0000;

/// HCI_Reset, the first command sent after startup.
pub(crate) const OPCODE_RESET: u16 = 0x0c03;

/// An owned, serialized HCI command packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandPacket {
    bytes: Vec<u8, CMD_BUF>,
}

impl CommandPacket {
    /// Serialize a typed command.
    pub fn encode<C: Cmd + WriteHci>(cmd: &C) -> Result<Self, Error> {
        let len = cmd.size();
        if len < CMD_HDR || len > CMD_BUF {
            return Err(Error::InsufficientSpace);
        }
        let mut buf = [0u8; CMD_BUF];
        cmd.write_hci(&mut buf[..len]).map_err(|_| Error::InsufficientSpace)?;
        Ok(Self {
            bytes: unwrap!(Vec::from_slice(&buf[..len])),
        })
    }

    /// Build a command packet from a raw opcode and parameter bytes, for
    /// commands (typically vendor specific ones) with no typed builder.
    pub fn new(opcode: u16, params: &[u8]) -> Result<Self, Error> {
        if params.len() > u8::MAX as usize {
            return Err(Error::InsufficientSpace);
        }
        let mut bytes = Vec::new();
        unwrap!(bytes.extend_from_slice(&opcode.to_le_bytes()));
        unwrap!(bytes.push(params.len() as u8));
        unwrap!(bytes.extend_from_slice(params));
        Ok(Self { bytes })
    }

    /// The opcode, read back out of the serialized header.
    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// The serialized packet, without the packet type indicator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Re-check the serialized form before it goes on the wire. The
    /// constructors only produce consistent packets, so a failure here
    /// means the issuer handed over corrupt bytes.
    fn check_wire_format(&self) {
        assert!(
            self.bytes.len() >= CMD_HDR && self.bytes.len() == CMD_HDR + self.bytes[2] as usize,
            "malformed command packet for opcode {:04x}",
            self.opcode()
        );
    }
}

/// Which of the two response events a command concludes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseKind {
    /// The command is answered with Command Complete carrying the result.
    Complete,
    /// The command is acknowledged with Command Status; the outcome
    /// arrives later as a dedicated event.
    Status,
}

/// An owned command response, either a Command Complete or a Command
/// Status, delivered to the issuer of the matching command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandResponse {
    kind: ResponseKind,
    opcode: u16,
    num_hci_command_packets: u8,
    params: Vec<u8, { u8::MAX as usize }>,
}

impl CommandResponse {
    /// Which response event this is.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// The opcode of the command this responds to.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// The command credits granted by the controller alongside this
    /// response.
    pub fn num_hci_command_packets(&self) -> u8 {
        self.num_hci_command_packets
    }

    /// The return parameters. For a Command Complete these start at the
    /// command's status octet; for a Command Status this is the status
    /// octet alone.
    pub fn return_params(&self) -> &[u8] {
        &self.params
    }

    /// The status octet, if the response carries one.
    ///
    /// A non-success status is not an error at this layer; it is the
    /// issuer's to interpret.
    pub fn status(&self) -> Option<Status> {
        Status::from_hci_bytes(&self.params).ok().map(|(status, _)| status)
    }
}

enum Sink {
    Complete(usize),
    Status(usize),
    /// Internal sink for the startup HCI_Reset: checks the status and has
    /// no consumer.
    ResetCheck,
}

impl Sink {
    fn kind(&self) -> ResponseKind {
        match self {
            Sink::Complete(_) | Sink::ResetCheck => ResponseKind::Complete,
            Sink::Status(_) => ResponseKind::Status,
        }
    }
}

struct Entry {
    packet: CommandPacket,
    sink: Sink,
}

enum SlotState {
    Free,
    Claimed,
    Ready(CommandResponse),
    Abandoned,
}

struct ResponseSlot {
    state: SlotState,
    waker: WakerRegistration,
}

impl ResponseSlot {
    const fn new() -> Self {
        Self {
            state: SlotState::Free,
            waker: WakerRegistration::new(),
        }
    }
}

struct State {
    queue: Deque<Entry, { config::COMMAND_QUEUE_SIZE }>,
    slots: [ResponseSlot; config::COMMAND_QUEUE_SIZE],
    credits: u8,
    waiting: Option<u16>,
    deadline: Option<Instant>,
    send_waker: WakerRegistration,
}

pub(crate) struct CommandQueue {
    state: RefCell<State>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: RefCell::new(State {
                queue: Deque::new(),
                slots: [const { ResponseSlot::new() }; config::COMMAND_QUEUE_SIZE],
                // One credit up front so the startup reset can go out
                // before the controller has said anything.
                credits: 1,
                waiting: None,
                deadline: None,
                send_waker: WakerRegistration::new(),
            }),
        }
    }

    /// Queue a command. Returns the slot on which the response will land.
    pub(crate) fn enqueue(&self, packet: CommandPacket, kind: ResponseKind) -> Result<usize, Error> {
        let mut state = self.state.borrow_mut();
        let Some(slot) = state.slots.iter().position(|s| matches!(s.state, SlotState::Free)) else {
            return Err(Error::CommandQueueFull);
        };
        let sink = match kind {
            ResponseKind::Complete => Sink::Complete(slot),
            ResponseKind::Status => Sink::Status(slot),
        };
        if state.queue.push_back(Entry { packet, sink }).is_err() {
            return Err(Error::CommandQueueFull);
        }
        state.slots[slot].state = SlotState::Claimed;
        state.send_waker.wake();
        Ok(slot)
    }

    /// Put the startup reset at the head of the queue, ahead of anything
    /// callers may have queued already.
    pub(crate) fn enqueue_reset_check(&self, packet: CommandPacket) {
        let mut state = self.state.borrow_mut();
        if state
            .queue
            .push_front(Entry {
                packet,
                sink: Sink::ResetCheck,
            })
            .is_err()
        {
            panic!("command queue full at startup");
        }
        state.send_waker.wake();
    }

    /// Wait until a command may be transmitted, then claim it.
    ///
    /// Claiming marks the head opcode as outstanding, consumes the credit
    /// and arms the response deadline; the caller must hand the returned
    /// bytes to the transport.
    pub(crate) async fn next_send(&self) -> CommandPacket {
        poll_fn(|cx| self.poll_next_send(cx)).await
    }

    fn poll_next_send(&self, cx: &mut Context<'_>) -> Poll<CommandPacket> {
        let mut state = self.state.borrow_mut();
        if state.credits == 0 || state.waiting.is_some() || state.queue.is_empty() {
            state.send_waker.register(cx.waker());
            return Poll::Pending;
        }
        let packet = unwrap!(state.queue.front()).packet.clone();
        packet.check_wire_format();
        let opcode = packet.opcode();
        trace!("[hci] sending command {:04x}", opcode);
        state.waiting = Some(opcode);
        // Only allow one outstanding command, whatever the controller
        // advertised.
        state.credits = 0;
        state.deadline = Some(Instant::now() + config::COMMAND_TIMEOUT);
        Poll::Ready(packet)
    }

    /// The outstanding opcode and its response deadline, if any.
    pub(crate) fn outstanding(&self) -> Option<(u16, Instant)> {
        let state = self.state.borrow();
        match (state.waiting, state.deadline) {
            (Some(opcode), Some(at)) => Some((opcode, at)),
            _ => None,
        }
    }

    pub(crate) fn on_command_complete(&self, event: &EventPacket) {
        let params = event.params();
        assert!(params.len() >= 3, "malformed command complete event");
        let credits = params[0];
        let opcode = u16::from_le_bytes([params[1], params[2]]);
        self.on_response(ResponseKind::Complete, opcode, credits, &params[3..]);
    }

    pub(crate) fn on_command_status(&self, event: &EventPacket) {
        let params = event.params();
        assert!(params.len() >= 4, "malformed command status event");
        let credits = params[1];
        let opcode = u16::from_le_bytes([params[2], params[3]]);
        self.on_response(ResponseKind::Status, opcode, credits, &params[..1]);
    }

    fn on_response(&self, kind: ResponseKind, opcode: u16, credits: u8, return_params: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.credits = credits;
        if opcode == OPCODE_NONE {
            // Credit return without a matching command.
            state.send_waker.wake();
            return;
        }
        let Some(waiting) = state.waiting else {
            panic!("unexpected {:?} response for {:04x} with no command outstanding", kind, opcode);
        };
        assert!(
            !state.queue.is_empty(),
            "unexpected {:?} response for {:04x} with empty command queue",
            kind,
            opcode
        );
        assert!(waiting == opcode, "waiting for {:04x}, got {:04x}", waiting, opcode);
        match (unwrap!(state.queue.front()).sink.kind(), kind) {
            (ResponseKind::Complete, ResponseKind::Status) => {
                panic!("waiting for command complete {:04x}, got command status for {:04x}", waiting, opcode)
            }
            (ResponseKind::Status, ResponseKind::Complete) => {
                panic!("waiting for command status {:04x}, got command complete for {:04x}", waiting, opcode)
            }
            _ => {}
        }
        let entry = unwrap!(state.queue.pop_front());
        state.waiting = None;
        state.deadline = None;
        let response = CommandResponse {
            kind,
            opcode,
            num_hci_command_packets: credits,
            params: unwrap!(Vec::from_slice(return_params)),
        };
        match entry.sink {
            Sink::ResetCheck => {
                debug_assert_eq!(opcode, OPCODE_RESET);
                let status = unwrap!(response.status(), "reset complete carried no status");
                if status.to_result().is_err() {
                    panic!("controller reset failed: {:?}", status);
                }
                debug!("[hci] controller reset complete");
            }
            Sink::Complete(slot) | Sink::Status(slot) => Self::deliver(&mut state.slots[slot], response),
        }
        state.send_waker.wake();
    }

    fn deliver(slot: &mut ResponseSlot, response: CommandResponse) {
        match core::mem::replace(&mut slot.state, SlotState::Free) {
            SlotState::Claimed => {
                slot.state = SlotState::Ready(response);
                slot.waker.wake();
            }
            // The issuer dropped its response future; the response dies here.
            SlotState::Abandoned => {}
            SlotState::Free | SlotState::Ready(_) => unreachable!("response delivered to unclaimed slot"),
        }
    }

    fn poll_response(&self, index: usize, cx: &mut Context<'_>) -> Poll<CommandResponse> {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.slots[index];
        match core::mem::replace(&mut slot.state, SlotState::Free) {
            SlotState::Ready(response) => Poll::Ready(response),
            SlotState::Claimed => {
                slot.state = SlotState::Claimed;
                slot.waker.register(cx.waker());
                Poll::Pending
            }
            SlotState::Free | SlotState::Abandoned => unreachable!("response future polled for unclaimed slot"),
        }
    }

    fn abandon(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.slots[index];
        match core::mem::replace(&mut slot.state, SlotState::Free) {
            // Response not in yet: leave a marker so delivery frees the slot.
            SlotState::Claimed => slot.state = SlotState::Abandoned,
            // Response arrived but was never consumed: discard it.
            SlotState::Ready(_) | SlotState::Free => {}
            SlotState::Abandoned => slot.state = SlotState::Abandoned,
        }
    }
}

/// A single-shot future resolving to the response of a queued command.
///
/// The command is on its way regardless of what happens to this future:
/// dropping it does not cancel anything, it only discards the response on
/// arrival.
#[must_use = "the command response arrives through this future"]
pub struct PendingResponse<'a> {
    queue: &'a CommandQueue,
    slot: usize,
    done: bool,
}

impl<'a> PendingResponse<'a> {
    pub(crate) fn new(queue: &'a CommandQueue, slot: usize) -> Self {
        Self { queue, slot, done: false }
    }
}

impl Future for PendingResponse<'_> {
    type Output = CommandResponse;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            panic!("response future polled after completion");
        }
        match this.queue.poll_response(this.slot, cx) {
            Poll::Ready(response) => {
                this.done = true;
                Poll::Ready(response)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.queue.abandon(self.slot);
        }
    }
}
