//! Per-peer link management for a serial packet port.
//!
//! Each remote physical address gets a link record that walks the
//! ring/ready/finished handshake. The port is a sans-io state machine:
//! the owning transport feeds received bytes in, polls for maintenance
//! on a timer, and drains paced output frames to the wire.

use super::frame::{PakbusFrameReader, SerialPacket};
use super::{ExpectMore, LinkState, PakbusAddr, Priority};
use crate::stamp::{Stamp, NSEC_PER_MSEC};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Port tuning knobs.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Our physical address.
    pub my_address: PakbusAddr,
    /// Beacon interval; zero disables beaconing.
    pub beacon_interval_ms: u32,
    /// Idle time in ready state before the link is finished.
    pub link_timeout_ms: u32,
    /// Gap between ring retries.
    pub ring_timeout_ms: u32,
    /// Ring retries before the link gives up and goes offline.
    pub ring_tries: u32,
    /// Pause between transmitted packets; zero for full-duplex links.
    pub send_delay_ms: u32,
    /// Cap on accumulated send-delay resets so a jabbering peer cannot
    /// hold the port forever.
    pub send_delay_base_ms: u32,
    /// Receive silence that forces every link offline.
    pub receive_watchdog_ms: u32,
}

impl PortConfig {
    /// Protocol defaults for a port at `my_address`.
    #[must_use]
    pub fn new(my_address: PakbusAddr) -> Self {
        Self {
            my_address,
            beacon_interval_ms: 0,
            link_timeout_ms: 40_000,
            ring_timeout_ms: 600,
            ring_tries: 5,
            send_delay_ms: 0,
            send_delay_base_ms: 5_000,
            receive_watchdog_ms: 40_000,
        }
    }
}

/// A high-level message queued for transmission on this port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMessage {
    pub dest: PakbusAddr,
    pub source: PakbusAddr,
    pub priority: Priority,
    /// Sets the expect-more header bit, keeping the session alive.
    pub expect_more: bool,
    pub body: Vec<u8>,
}

/// The upstream router a port pumps frames for.
pub trait PortRouter: Send {
    /// Pops the next message queued for `dest`, if any.
    fn next_out_message(&mut self, dest: PakbusAddr) -> Option<OutMessage>;
    /// Delivers a received data packet upstream.
    fn on_packet_received(&mut self, packet: &SerialPacket);
    /// Reports that the link to `dest` has gone offline.
    fn on_link_offline(&mut self, dest: PakbusAddr);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Offline,
    Ringing,
    Ready,
    Finished,
}

struct Link {
    phase: Phase,
    last_activity: Stamp,
    last_ring: Stamp,
    rings_sent: u32,
    finished_at: Stamp,
}

impl Link {
    fn new(now: Stamp) -> Self {
        Self {
            phase: Phase::Offline,
            last_activity: now,
            last_ring: now,
            rings_sent: 0,
            finished_at: now,
        }
    }
}

/// A serial packet port bound to one physical interface.
pub struct SerialPacketPort<R: PortRouter> {
    router: R,
    config: PortConfig,
    links: HashMap<PakbusAddr, Link>,
    reader: PakbusFrameReader,
    out_queue: VecDeque<Vec<u8>>,
    next_send_at: Stamp,
    send_delay_started: Option<Stamp>,
    expect_more: HashMap<(PakbusAddr, PakbusAddr), u32>,
    waiting_broadcasts: Vec<OutMessage>,
    last_valid_rx: Stamp,
    last_beacon: Stamp,
    comm_enabled: bool,
    carrier_check: Option<Box<dyn Fn(&[u8]) -> bool + Send>>,
    read_tail: Vec<u8>,
}

impl<R: PortRouter> SerialPacketPort<R> {
    #[must_use]
    pub fn new(router: R, config: PortConfig, now: Stamp) -> Self {
        Self {
            router,
            config,
            links: HashMap::new(),
            reader: PakbusFrameReader::new(),
            out_queue: VecDeque::new(),
            next_send_at: now,
            send_delay_started: None,
            expect_more: HashMap::new(),
            waiting_broadcasts: Vec::new(),
            last_valid_rx: now,
            last_beacon: now,
            comm_enabled: true,
            carrier_check: None,
            read_tail: Vec::new(),
        }
    }

    /// Installs the no-carrier hook consulted on maintenance ticks.
    pub fn set_carrier_check(&mut self, check: Box<dyn Fn(&[u8]) -> bool + Send>) {
        self.carrier_check = Some(check);
    }

    /// Upstream router access, mostly for tests and teardown.
    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    /// The router signalled that a message is queued for `dest`.
    pub fn on_message_ready(&mut self, dest: PakbusAddr, now: Stamp) {
        if !self.comm_enabled {
            return;
        }
        let link = self.links.entry(dest).or_insert_with(|| Link::new(now));
        match link.phase {
            Phase::Offline => {
                link.phase = Phase::Ringing;
                link.rings_sent = 0;
                self.send_ring(dest, now);
            }
            Phase::Ringing => {}
            Phase::Ready => self.pump(dest, now),
            Phase::Finished => {
                // New traffic revives a finishing link only while the
                // peer is plausibly still listening.
                if now - link.last_activity < i64::from(self.config.link_timeout_ms) * NSEC_PER_MSEC {
                    link.phase = Phase::Ready;
                    self.pump(dest, now);
                } else {
                    link.phase = Phase::Ringing;
                    link.rings_sent = 0;
                    self.send_ring(dest, now);
                }
            }
        }
    }

    /// The router withdrew everything queued for `dest`.
    pub fn on_message_aborted(&mut self, dest: PakbusAddr, now: Stamp) {
        if let Some(link) = self.links.get_mut(&dest) {
            if link.phase == Phase::Ringing {
                link.phase = Phase::Offline;
                link.last_activity = now;
            }
        }
    }

    /// Queues a broadcast; flushed the next time any link is ready and
    /// never retried after a failed ring.
    pub fn broadcast_message(&mut self, msg: OutMessage, now: Stamp) {
        self.waiting_broadcasts.push(msg);
        if self.links.values().any(|link| link.phase == Phase::Ready) {
            self.flush_broadcasts(now);
        }
    }

    /// True when outbound session bookkeeping says frames are still
    /// expected between the pair.
    #[must_use]
    pub fn has_session(&self, source: PakbusAddr, dest: PakbusAddr) -> bool {
        self.expect_more.get(&(source, dest)).copied().unwrap_or(0) > 0
    }

    /// Bumps the link activity clock for a session pair.
    pub fn reset_session_timer(&mut self, _source: PakbusAddr, dest: PakbusAddr, now: Stamp) {
        if let Some(link) = self.links.get_mut(&dest) {
            link.last_activity = now;
        }
    }

    /// True while any link is up or negotiating.
    #[must_use]
    pub fn link_is_active(&self) -> bool {
        self.links.values().any(|link| link.phase != Phase::Offline)
    }

    /// True while any link waits in the finished handshake.
    #[must_use]
    pub fn waiting_for_off(&self) -> bool {
        self.links.values().any(|link| link.phase == Phase::Finished)
    }

    /// Enables or disables communication; disabling forces every link
    /// offline.
    pub fn on_comm_enabled_change(&mut self, enabled: bool, now: Stamp) {
        self.comm_enabled = enabled;
        if !enabled {
            self.force_all_offline("communications disabled", now);
        }
    }

    /// Feeds raw bytes read from the interface.
    pub fn on_data_read(&mut self, bytes: &[u8], now: Stamp) {
        self.read_tail.extend_from_slice(bytes);
        let tail_cap = 64;
        if self.read_tail.len() > tail_cap {
            let cut = self.read_tail.len() - tail_cap;
            self.read_tail.drain(..cut);
        }
        // Half-duplex pacing: hold transmissions briefly after hearing
        // the peer, bounded by the send-delay base.
        if self.config.send_delay_ms > 0 {
            self.next_send_at = now + i64::from(self.config.send_delay_ms) * NSEC_PER_MSEC;
            if self.send_delay_started.is_none() {
                self.send_delay_started = Some(now);
            }
        }
        for frame in self.reader.feed(bytes) {
            match frame {
                Ok(packet) => self.on_frame(packet, now),
                Err(error) => trace!(%error, "dropped serial frame"),
            }
        }
    }

    /// Periodic maintenance: ring retries, link timeouts, beacons and
    /// the receive/no-carrier watchdogs.
    pub fn poll(&mut self, now: Stamp) {
        let carrier_lost = self
            .carrier_check
            .as_ref()
            .is_some_and(|check| check(&self.read_tail));
        if carrier_lost {
            self.read_tail.clear();
            self.force_all_offline("no carrier", now);
            return;
        }
        if self.link_is_active()
            && now - self.last_valid_rx > i64::from(self.config.receive_watchdog_ms) * NSEC_PER_MSEC
        {
            self.force_all_offline("receive watchdog expired", now);
            return;
        }

        let link_timeout = i64::from(self.config.link_timeout_ms) * NSEC_PER_MSEC;
        let ring_timeout = i64::from(self.config.ring_timeout_ms) * NSEC_PER_MSEC;
        let addresses: Vec<PakbusAddr> = self.links.keys().copied().collect();
        for addr in addresses {
            let Some(link) = self.links.get_mut(&addr) else { continue };
            match link.phase {
                Phase::Ringing => {
                    if now - link.last_ring >= ring_timeout {
                        if link.rings_sent >= self.config.ring_tries {
                            debug!(%addr, "ring went unanswered; link offline");
                            link.phase = Phase::Offline;
                            self.clear_sessions(addr);
                            self.router.on_link_offline(addr);
                        } else {
                            self.send_ring(addr, now);
                        }
                    }
                }
                Phase::Ready => {
                    let has_session = self
                        .expect_more
                        .iter()
                        .any(|((_, dest), count)| *dest == addr && *count > 0);
                    if !has_session && now - link.last_activity >= link_timeout {
                        debug!(%addr, "link idle; sending finished");
                        link.phase = Phase::Finished;
                        link.finished_at = now;
                        self.queue_frame(SerialPacket::control(
                            LinkState::Finished,
                            addr,
                            self.config.my_address,
                        ));
                    }
                }
                Phase::Finished => {
                    if now - link.finished_at >= link_timeout {
                        debug!(%addr, "finished ack never came; link offline");
                        link.phase = Phase::Offline;
                        self.clear_sessions(addr);
                        self.router.on_link_offline(addr);
                    }
                }
                Phase::Offline => {}
            }
        }

        if self.config.beacon_interval_ms > 0 {
            let interval = i64::from(self.config.beacon_interval_ms) * NSEC_PER_MSEC;
            let idle_since = self.last_valid_rx.max(self.last_beacon);
            if now - idle_since >= interval {
                self.last_beacon = now;
                trace!("transmitting beacon");
                self.queue_frame(SerialPacket::control(
                    LinkState::Ring,
                    PakbusAddr::broadcast(),
                    self.config.my_address,
                ));
            }
        }
    }

    /// Pops the next frame to write if pacing allows it.
    pub fn take_output(&mut self, now: Stamp) -> Option<Vec<u8>> {
        if self.out_queue.is_empty() {
            return None;
        }
        if now < self.next_send_at {
            // Let a capped delay through so a jabbering peer cannot
            // park the port indefinitely.
            let capped = self.send_delay_started.is_some_and(|started| {
                now - started >= i64::from(self.config.send_delay_base_ms) * NSEC_PER_MSEC
            });
            if !capped {
                return None;
            }
        }
        let frame = self.out_queue.pop_front()?;
        if self.config.send_delay_ms > 0 {
            self.next_send_at = now + i64::from(self.config.send_delay_ms) * NSEC_PER_MSEC;
            self.send_delay_started = None;
        }
        Some(frame)
    }

    /// Earliest time a queued frame may be written, if any are queued.
    #[must_use]
    pub fn next_send_time(&self) -> Option<Stamp> {
        if self.out_queue.is_empty() {
            None
        } else {
            Some(self.next_send_at)
        }
    }

    fn on_frame(&mut self, packet: SerialPacket, now: Stamp) {
        if packet.dest != self.config.my_address && packet.dest != PakbusAddr::broadcast() {
            trace!(dest = %packet.dest, "frame for another node ignored");
            return;
        }
        self.last_valid_rx = now;
        let addr = packet.source;
        let link = self.links.entry(addr).or_insert_with(|| Link::new(now));
        link.last_activity = now;

        match packet.link_state {
            LinkState::Ring => {
                // A ring from any state brings the link up; answer so
                // the peer sees ready.
                let was_ready = link.phase == Phase::Ready;
                link.phase = Phase::Ready;
                debug!(%addr, "peer rang; link ready");
                if !was_ready {
                    self.queue_frame(SerialPacket::control(
                        LinkState::Ready,
                        addr,
                        self.config.my_address,
                    ));
                }
                self.pump(addr, now);
                self.flush_broadcasts(now);
            }
            LinkState::Ready => {
                match link.phase {
                    Phase::Ringing | Phase::Offline => {
                        debug!(%addr, "link ready");
                        link.phase = Phase::Ready;
                        self.pump(addr, now);
                        self.flush_broadcasts(now);
                    }
                    Phase::Ready | Phase::Finished => {}
                }
            }
            LinkState::Finished => {
                // The peer wants off; acknowledge and drop the link.
                link.phase = Phase::Offline;
                self.queue_frame(SerialPacket::control(
                    LinkState::OffLine,
                    addr,
                    self.config.my_address,
                ));
                self.clear_sessions(addr);
                self.router.on_link_offline(addr);
                debug!(%addr, "peer finished; link offline");
            }
            LinkState::OffLine => {
                if link.phase != Phase::Offline {
                    link.phase = Phase::Offline;
                    self.clear_sessions(addr);
                    self.router.on_link_offline(addr);
                    debug!(%addr, "peer offline");
                }
            }
        }

        if !packet.payload.is_empty() {
            self.router.on_packet_received(&packet);
        }
    }

    fn pump(&mut self, dest: PakbusAddr, now: Stamp) {
        while let Some(msg) = self.router.next_out_message(dest) {
            let expect_more = if msg.expect_more {
                let counter = self.expect_more.entry((msg.source, msg.dest)).or_insert(0);
                *counter += 1;
                ExpectMore::ExpectMore
            } else {
                if let Some(counter) = self.expect_more.get_mut(&(msg.source, msg.dest)) {
                    *counter = counter.saturating_sub(1);
                }
                ExpectMore::Last
            };
            let packet = SerialPacket {
                link_state: LinkState::Ready,
                dest: msg.dest,
                hops: 0,
                expect_more,
                priority: msg.priority,
                source: msg.source,
                payload: msg.body,
            };
            self.queue_frame(packet);
            if let Some(link) = self.links.get_mut(&dest) {
                link.last_activity = now;
            }
        }
    }

    fn flush_broadcasts(&mut self, now: Stamp) {
        let broadcasts = std::mem::take(&mut self.waiting_broadcasts);
        for msg in broadcasts {
            let packet = SerialPacket {
                link_state: LinkState::Ready,
                dest: PakbusAddr::broadcast(),
                hops: 0,
                expect_more: ExpectMore::Neutral,
                priority: msg.priority,
                source: msg.source,
                payload: msg.body,
            };
            self.queue_frame(packet);
        }
        let _ = now;
    }

    fn send_ring(&mut self, dest: PakbusAddr, now: Stamp) {
        if let Some(link) = self.links.get_mut(&dest) {
            link.last_ring = now;
            link.rings_sent += 1;
        }
        trace!(%dest, "ringing peer");
        self.queue_frame(SerialPacket::control(
            LinkState::Ring,
            dest,
            self.config.my_address,
        ));
    }

    fn queue_frame(&mut self, packet: SerialPacket) {
        self.out_queue.push_back(packet.encode());
    }

    fn clear_sessions(&mut self, addr: PakbusAddr) {
        self.expect_more.retain(|(_, dest), _| *dest != addr);
    }

    fn force_all_offline(&mut self, why: &str, now: Stamp) {
        warn!(why, "forcing all links offline");
        let addresses: Vec<PakbusAddr> = self
            .links
            .iter()
            .filter(|(_, link)| link.phase != Phase::Offline)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addresses {
            if let Some(link) = self.links.get_mut(&addr) {
                link.phase = Phase::Offline;
                link.last_activity = now;
            }
            self.clear_sessions(addr);
            self.router.on_link_offline(addr);
        }
        self.out_queue.clear();
    }

    #[cfg(test)]
    fn phase_of(&self, addr: PakbusAddr) -> Option<Phase> {
        self.links.get(&addr).map(|link| link.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::NSEC_PER_SEC;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockRouter {
        queued: VecDeque<OutMessage>,
        received: Vec<SerialPacket>,
        offline: Vec<PakbusAddr>,
    }

    impl PortRouter for MockRouter {
        fn next_out_message(&mut self, dest: PakbusAddr) -> Option<OutMessage> {
            if self.queued.front().is_some_and(|msg| msg.dest == dest) {
                self.queued.pop_front()
            } else {
                None
            }
        }

        fn on_packet_received(&mut self, packet: &SerialPacket) {
            self.received.push(packet.clone());
        }

        fn on_link_offline(&mut self, dest: PakbusAddr) {
            self.offline.push(dest);
        }
    }

    fn me() -> PakbusAddr {
        PakbusAddr::try_new(0x001).unwrap()
    }

    fn peer() -> PakbusAddr {
        PakbusAddr::try_new(0x042).unwrap()
    }

    fn port() -> SerialPacketPort<MockRouter> {
        SerialPacketPort::new(MockRouter::default(), PortConfig::new(me()), Stamp::from_nanos(0))
    }

    fn decode_all(bytes: &[u8]) -> Vec<SerialPacket> {
        let mut reader = PakbusFrameReader::new();
        reader
            .feed(bytes)
            .into_iter()
            .map(|frame| frame.unwrap())
            .collect()
    }

    fn drain(port: &mut SerialPacketPort<MockRouter>, now: Stamp) -> Vec<SerialPacket> {
        let mut frames = Vec::new();
        while let Some(bytes) = port.take_output(now) {
            frames.extend(decode_all(&bytes));
        }
        frames
    }

    fn queue_message(port: &mut SerialPacketPort<MockRouter>, expect_more: bool) {
        port.router_mut().queued.push_back(OutMessage {
            dest: peer(),
            source: me(),
            priority: Priority::Normal,
            expect_more,
            body: b"bmp5 payload".to_vec(),
        });
    }

    #[test]
    fn ring_handshake_carries_data_then_finishes() {
        let mut port = port();
        let mut now = Stamp::from_nanos(0);

        // Outbound traffic rings the peer.
        queue_message(&mut port, false);
        port.on_message_ready(peer(), now);
        let frames = drain(&mut port, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].link_state, LinkState::Ring);
        assert_eq!(frames[0].dest, peer());

        // The peer answers ready within the ring window.
        now += 300 * NSEC_PER_MSEC;
        let ready = SerialPacket::control(LinkState::Ready, me(), peer());
        port.on_data_read(&ready.encode(), now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Ready));
        let frames = drain(&mut port, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].link_state, LinkState::Ready);
        assert_eq!(frames[0].payload, b"bmp5 payload");

        // Idle past the link timeout emits finished.
        now += 41 * NSEC_PER_SEC;
        port.poll(now);
        let frames = drain(&mut port, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].link_state, LinkState::Finished);
        assert_eq!(port.phase_of(peer()), Some(Phase::Finished));

        // The peer acks with offline; link returns to offline.
        let offline = SerialPacket::control(LinkState::OffLine, me(), peer());
        port.on_data_read(&offline.encode(), now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Offline));
        assert_eq!(port.router_mut().offline, vec![peer()]);
    }

    #[test]
    fn unanswered_rings_retry_then_go_offline() {
        let mut port = port();
        let mut now = Stamp::from_nanos(0);
        queue_message(&mut port, false);
        port.on_message_ready(peer(), now);
        let _ = drain(&mut port, now);
        let mut rings = 1;
        for _ in 0..10 {
            now += 700 * NSEC_PER_MSEC;
            port.poll(now);
            rings += drain(&mut port, now)
                .iter()
                .filter(|frame| frame.link_state == LinkState::Ring)
                .count();
            if port.phase_of(peer()) == Some(Phase::Offline) {
                break;
            }
        }
        assert_eq!(port.phase_of(peer()), Some(Phase::Offline));
        assert_eq!(rings, 5);
        assert_eq!(port.router_mut().offline, vec![peer()]);
    }

    #[test]
    fn peer_ring_makes_link_ready_and_is_answered() {
        let mut port = port();
        let now = Stamp::from_nanos(0);
        let ring = SerialPacket::control(LinkState::Ring, me(), peer());
        port.on_data_read(&ring.encode(), now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Ready));
        let frames = drain(&mut port, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].link_state, LinkState::Ready);
    }

    #[test]
    fn received_data_reaches_the_router() {
        let mut port = port();
        let now = Stamp::from_nanos(0);
        let mut data = SerialPacket::control(LinkState::Ready, me(), peer());
        data.payload = b"upstream".to_vec();
        port.on_data_read(&data.encode(), now);
        assert_eq!(port.router_mut().received.len(), 1);
        assert_eq!(port.router_mut().received[0].payload, b"upstream");
    }

    #[test]
    fn expect_more_tracks_sessions() {
        let mut port = port();
        let now = Stamp::from_nanos(0);
        queue_message(&mut port, true);
        port.on_message_ready(peer(), now);
        let ready = SerialPacket::control(LinkState::Ready, me(), peer());
        port.on_data_read(&ready.encode(), now);
        let _ = drain(&mut port, now);
        assert!(port.has_session(me(), peer()));

        // A final frame closes the session accounting.
        queue_message(&mut port, false);
        port.on_message_ready(peer(), now);
        let _ = drain(&mut port, now);
        assert!(!port.has_session(me(), peer()));
    }

    #[test]
    fn session_holds_link_past_idle_timeout() {
        let mut port = port();
        let mut now = Stamp::from_nanos(0);
        queue_message(&mut port, true);
        port.on_message_ready(peer(), now);
        port.on_data_read(&SerialPacket::control(LinkState::Ready, me(), peer()).encode(), now);
        let _ = drain(&mut port, now);
        assert!(port.has_session(me(), peer()));
        now += 41 * NSEC_PER_SEC;
        port.reset_session_timer(me(), peer(), now);
        port.poll(now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Ready));
    }

    #[test]
    fn half_duplex_pacing_delays_output() {
        let mut port = SerialPacketPort::new(
            MockRouter::default(),
            PortConfig {
                send_delay_ms: 100,
                ..PortConfig::new(me())
            },
            Stamp::from_nanos(0),
        );
        let now = Stamp::from_nanos(0);
        // Hearing the peer pushes the send window out.
        port.on_data_read(&SerialPacket::control(LinkState::Ring, me(), peer()).encode(), now);
        assert!(port.take_output(now).is_none());
        let later = now + 150 * NSEC_PER_MSEC;
        assert!(port.take_output(later).is_some());
    }

    #[test]
    fn beacons_fire_on_idle_interval() {
        let mut port = SerialPacketPort::new(
            MockRouter::default(),
            PortConfig {
                beacon_interval_ms: 60_000,
                receive_watchdog_ms: 600_000,
                ..PortConfig::new(me())
            },
            Stamp::from_nanos(0),
        );
        let now = Stamp::from_nanos(61 * NSEC_PER_SEC);
        port.poll(now);
        let frames = drain(&mut port, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].link_state, LinkState::Ring);
        assert_eq!(frames[0].dest, PakbusAddr::broadcast());
    }

    #[test]
    fn no_carrier_forces_links_offline() {
        let mut port = port();
        let now = Stamp::from_nanos(0);
        port.set_carrier_check(Box::new(|tail| {
            tail.windows(10).any(|window| window == b"NO CARRIER")
        }));
        port.on_data_read(&SerialPacket::control(LinkState::Ring, me(), peer()).encode(), now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Ready));
        port.on_data_read(b"NO CARRIER\r\n", now);
        port.poll(now);
        assert_eq!(port.phase_of(peer()), Some(Phase::Offline));
    }

    #[test]
    fn broadcasts_flush_when_a_link_is_ready() {
        let mut port = port();
        let now = Stamp::from_nanos(0);
        port.broadcast_message(
            OutMessage {
                dest: PakbusAddr::broadcast(),
                source: me(),
                priority: Priority::Normal,
                expect_more: false,
                body: b"hello all".to_vec(),
            },
            now,
        );
        // Nothing ready yet, so the broadcast waits.
        assert!(drain(&mut port, now).is_empty());
        port.on_data_read(&SerialPacket::control(LinkState::Ring, me(), peer()).encode(), now);
        let frames = drain(&mut port, now);
        assert!(frames
            .iter()
            .any(|frame| frame.dest == PakbusAddr::broadcast() && frame.payload == b"hello all"));
    }
}
