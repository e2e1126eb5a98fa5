//! The HCI layer proper: owns the pipeline state and drives the driver.

use core::future::pending;

use bt_hci::cmd::controller_baseband::Reset;
use bt_hci::cmd::{AsyncCmd, SyncCmd};
use bt_hci::WriteHci;
use embassy_futures::select::{select4, Either4};
use embassy_time::Timer;

use crate::acl::{AclConduit, AclPacket, AclQueueEnd};
use crate::command::{CommandPacket, CommandQueue, PendingResponse, ResponseKind};
use crate::driver::{HciDriver, HciMessageType};
use crate::event::{DropEvent, EventCode, EventHandler, EventPacket, EventRegistry, SubeventCode};
use crate::{config, Error, HciLayerError};

static DROP_EVENT: DropEvent = DropEvent;

/// The host side of the Host Controller Interface.
///
/// The layer multiplexes three things over one controller transport: the
/// serialized command channel, the event demultiplexer, and the ACL data
/// path. It holds no threads of its own; all processing happens inside
/// [`Runner::run`], and every public operation returns without blocking.
///
/// Command responses resolve on the issuing task, not inside the run
/// loop, so a slow consumer never stalls the controller traffic.
pub struct HciLayer<'d> {
    pub(crate) commands: CommandQueue,
    pub(crate) events: EventRegistry<'d>,
    pub(crate) acl: AclConduit,
}

impl<'d> HciLayer<'d> {
    /// Create a new layer.
    pub fn new() -> Self {
        let events = EventRegistry::new();
        // Codes the controller is expected to emit but nothing consumes;
        // routed to a no-op handler so they are not logged as dropped.
        events.register(EventCode::PAGE_SCAN_REPETITION_MODE_CHANGE, &DROP_EVENT);
        events.register(EventCode::MAX_SLOTS_CHANGE, &DROP_EVENT);
        events.register(EventCode::VENDOR_SPECIFIC, &DROP_EVENT);
        Self {
            commands: CommandQueue::new(),
            events,
            acl: AclConduit::new(),
        }
    }

    /// Queue a command whose result arrives in a Command Complete event.
    ///
    /// Returns a single-shot future resolving to the response. The command
    /// goes on the wire once every earlier command has been answered.
    pub fn command<C: SyncCmd + WriteHci>(&self, cmd: &C) -> Result<PendingResponse<'_>, Error> {
        self.enqueue_for_complete(CommandPacket::encode(cmd)?)
    }

    /// Queue a command that is acknowledged with a Command Status event;
    /// its outcome arrives later as a dedicated event.
    pub fn async_command<C: AsyncCmd + WriteHci>(&self, cmd: &C) -> Result<PendingResponse<'_>, Error> {
        self.enqueue_for_status(CommandPacket::encode(cmd)?)
    }

    /// Queue a pre-serialized command expecting a Command Complete.
    pub fn enqueue_for_complete(&self, packet: CommandPacket) -> Result<PendingResponse<'_>, Error> {
        let slot = self.commands.enqueue(packet, ResponseKind::Complete)?;
        Ok(PendingResponse::new(&self.commands, slot))
    }

    /// Queue a pre-serialized command expecting a Command Status.
    pub fn enqueue_for_status(&self, packet: CommandPacket) -> Result<PendingResponse<'_>, Error> {
        let slot = self.commands.enqueue(packet, ResponseKind::Status)?;
        Ok(PendingResponse::new(&self.commands, slot))
    }

    /// Register `handler` for an event code.
    ///
    /// Panics if the code already has a handler, or if it is one of the
    /// command response codes and the LE Meta code, which are routed
    /// internally.
    pub fn register_event_handler(&self, code: EventCode, handler: &'d dyn EventHandler) {
        match code {
            EventCode::COMMAND_COMPLETE | EventCode::COMMAND_STATUS | EventCode::LE_META_EVENT => {
                panic!("event code {:?} is routed internally", code)
            }
            _ => self.events.register(code, handler),
        }
    }

    /// Remove the handler for an event code. Panics if none is installed.
    pub fn unregister_event_handler(&self, code: EventCode) {
        self.events.unregister(code);
    }

    /// Register `handler` for an LE Meta subevent code.
    ///
    /// Panics if the subevent code already has a handler.
    pub fn register_le_event_handler(&self, subevent: SubeventCode, handler: &'d dyn EventHandler) {
        self.events.register_le(subevent, handler);
    }

    /// Remove the handler for an LE subevent code. Panics if none is
    /// installed.
    pub fn unregister_le_event_handler(&self, subevent: SubeventCode) {
        self.events.unregister_le(subevent);
    }

    /// The upper-layer end of the ACL data path.
    pub fn acl_queue_end(&self) -> AclQueueEnd<'_> {
        self.acl.up_end()
    }
}

impl Default for HciLayer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an [`HciLayer`] over an [`HciDriver`].
pub struct Runner<'d, D: HciDriver> {
    layer: &'d HciLayer<'d>,
    driver: D,
}

impl<'d, D: HciDriver> Runner<'d, D> {
    /// Create a runner for `layer` over `driver`.
    pub fn new(layer: &'d HciLayer<'d>, driver: D) -> Self {
        Self { layer, driver }
    }

    /// Run the layer.
    ///
    /// The first packet handed to the driver is always HCI_Reset; a reset
    /// failure is fatal. After that the loop serves controller traffic,
    /// the command channel and the outbound ACL queue until the driver
    /// reports an error. Dropping the returned future stops all
    /// processing; queued commands keep their place and transmission
    /// resumes if `run` is called again.
    pub async fn run(&mut self) -> Result<(), HciLayerError<D::Error>> {
        self.layer
            .commands
            .enqueue_reset_check(CommandPacket::encode(&Reset::new())?);

        let mut rx = [0u8; config::MAX_HCI_PACKET_LEN];
        loop {
            let result = select4(
                self.driver.read(&mut rx),
                self.layer.commands.next_send(),
                self.layer.acl.next_outbound(),
                stalled(&self.layer.commands),
            )
            .await;
            match result {
                Either4::First(kind) => {
                    let kind = kind.map_err(HciLayerError::Driver)?;
                    Self::on_rx(self.layer, kind, &rx);
                }
                Either4::Second(packet) => {
                    self.driver
                        .write(HciMessageType::Command, packet.as_bytes())
                        .await
                        .map_err(HciLayerError::Driver)?;
                }
                Either4::Third(packet) => {
                    self.driver
                        .write(HciMessageType::AclData, packet.as_bytes())
                        .await
                        .map_err(HciLayerError::Driver)?;
                }
                Either4::Fourth(opcode) => {
                    panic!("timed out waiting for response to {:04x}", opcode);
                }
            }
        }
    }

    /// Dispatch one packet received from the controller.
    fn on_rx(layer: &HciLayer<'_>, kind: HciMessageType, data: &[u8]) {
        match kind {
            HciMessageType::Event => {
                let event = unwrap!(EventPacket::parse(data), "invalid event packet from controller");
                match event.code() {
                    EventCode::COMMAND_COMPLETE => layer.commands.on_command_complete(&event),
                    EventCode::COMMAND_STATUS => layer.commands.on_command_status(&event),
                    EventCode::LE_META_EVENT => layer.events.dispatch_le(&event),
                    _ => layer.events.dispatch(&event),
                }
            }
            HciMessageType::AclData => {
                let packet = unwrap!(AclPacket::parse(data), "invalid acl packet from controller");
                layer.acl.push_inbound(packet);
            }
            HciMessageType::SyncData => {
                // TODO: route synchronous data once there is a SCO conduit
                // to put it on.
                debug!("[hci] discarding synchronous data packet");
            }
            HciMessageType::Command => {
                panic!("driver delivered a command packet to the host");
            }
        }
    }
}

/// Resolves with the outstanding opcode once the controller has taken too
/// long to answer it. Pends forever while nothing is outstanding; the run
/// loop re-evaluates after every state change.
async fn stalled(commands: &CommandQueue) -> u16 {
    match commands.outstanding() {
        Some((opcode, at)) => {
            Timer::at(at).await;
            opcode
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::Cell;

    use bt_hci::cmd::controller_baseband::SetEventMask;
    use bt_hci::param::EventMask;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::{select, Either};
    use embassy_time::{Duration, Timer};

    use super::*;
    use crate::event::SubeventCode;
    use crate::mock_driver::MockBus;

    const RESET_BYTES: &[u8] = &[0x03, 0x0c, 0x00];

    fn command_complete(opcode: u16, credits: u8, return_params: &[u8]) -> std::vec::Vec<u8> {
        let mut bytes = std::vec![0x0e, 3 + return_params.len() as u8, credits, opcode as u8, (opcode >> 8) as u8];
        bytes.extend_from_slice(return_params);
        bytes
    }

    /// Runs the layer until `script` completes.
    fn harness<'d>(script: impl core::future::Future<Output = ()>, bus: &MockBus, layer: &'d HciLayer<'d>) {
        let mut runner = Runner::new(layer, bus.driver());
        block_on(async {
            match select(runner.run(), script).await {
                Either::First(result) => panic!("runner stopped early: {:?}", result),
                Either::Second(()) => {}
            }
        });
    }

    #[test]
    fn reset_goes_out_first_and_unlocks_the_pipeline() {
        let bus = MockBus::new();
        let layer = HciLayer::new();
        harness(
            async {
                // A command queued right away still waits for the reset exchange.
                let response = layer
                    .command(&SetEventMask::new(EventMask::new().enable_le_meta(true)))
                    .unwrap();

                let (kind, bytes) = bus.sent().await;
                assert_eq!(kind, HciMessageType::Command);
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x00])).await;

                let (_, bytes) = bus.sent().await;
                assert_eq!(bytes[..2], [0x01, 0x0c]);
                bus.inject(HciMessageType::Event, &command_complete(0x0c01, 1, &[0x00])).await;

                let response = response.await;
                assert_eq!(response.opcode(), 0x0c01);
            },
            &bus,
            &layer,
        );
    }

    #[test]
    #[should_panic(expected = "reset failed")]
    fn failed_reset_stops_startup() {
        let bus = MockBus::new();
        let layer = HciLayer::new();
        harness(
            async {
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x01])).await;
                // The layer must die before this elapses.
                Timer::after(Duration::from_secs(5)).await;
            },
            &bus,
            &layer,
        );
    }

    #[test]
    #[should_panic(expected = "timed out waiting for response to 0c03")]
    fn silent_controller_is_fatal() {
        let bus = MockBus::new();
        let layer = HciLayer::new();
        harness(
            async {
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                // Never answer; the command deadline has to fire.
                Timer::after(config::COMMAND_TIMEOUT * 2).await;
            },
            &bus,
            &layer,
        );
    }

    #[test]
    fn le_meta_events_reach_the_subevent_handler() {
        struct Counter(Cell<usize>);
        impl EventHandler for Counter {
            fn on_event(&self, event: &EventPacket) {
                assert_eq!(event.subevent_code(), Some(SubeventCode::new(0x0a)));
                self.0.set(self.0.get() + 1);
            }
        }

        let handler = Counter(Cell::new(0));
        let bus = MockBus::new();
        let layer = HciLayer::new();
        layer.register_le_event_handler(SubeventCode::new(0x0a), &handler);
        harness(
            async {
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x00])).await;

                bus.inject(HciMessageType::Event, &[0x3e, 0x02, 0x0a, 0x00]).await;
                // An unregistered ordinary event is dropped quietly.
                bus.inject(HciMessageType::Event, &[0x12, 0x01, 0x00]).await;
                // Round-trip an ACL packet to know both events were processed.
                bus.inject(HciMessageType::AclData, &[0x01, 0x00, 0x01, 0x00, 0xaa]).await;
                let incoming = layer.acl_queue_end().read().await;
                assert_eq!(incoming.payload(), &[0xaa]);
            },
            &bus,
            &layer,
        );
        assert_eq!(handler.0.get(), 1);
    }

    #[test]
    fn acl_packets_flow_both_ways() {
        let bus = MockBus::new();
        let layer = HciLayer::new();
        harness(
            async {
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x00])).await;

                let up = layer.acl_queue_end();
                let outgoing = crate::acl::AclPacket::new(
                    0x0040,
                    crate::acl::BoundaryFlag::FirstAutoFlushable,
                    crate::acl::HostBroadcastFlag::NoBroadcast,
                    &[1, 2, 3],
                )
                .unwrap();
                let ((), (kind, bytes)) = join(up.write(outgoing.clone()), bus.sent()).await;
                assert_eq!(kind, HciMessageType::AclData);
                assert_eq!(&bytes[..], outgoing.as_bytes());

                bus.inject(HciMessageType::AclData, &[0x41, 0x20, 0x02, 0x00, 0xbb, 0xcc]).await;
                let incoming = up.read().await;
                assert_eq!(incoming.handle(), 0x0041);
                assert_eq!(incoming.payload(), &[0xbb, 0xcc]);
            },
            &bus,
            &layer,
        );
    }

    #[test]
    fn sco_data_is_discarded() {
        let bus = MockBus::new();
        let layer = HciLayer::new();
        harness(
            async {
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::SyncData, &[0x01, 0x00, 0x02, 0xaa, 0xbb]).await;
                // The layer is still alive and serving afterwards.
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x00])).await;
                let response = layer.command(&Reset::new()).unwrap();
                let (_, bytes) = bus.sent().await;
                assert_eq!(&bytes[..], RESET_BYTES);
                bus.inject(HciMessageType::Event, &command_complete(0x0c03, 1, &[0x00])).await;
                response.await;
            },
            &bus,
            &layer,
        );
    }
}
