use std::collections::{HashSet, VecDeque};

use mqttbytes::v4::{
    ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
};
use mqttbytes::{Protocol, QoS};

use crate::session::packet_id::{Flow, PacketIdPool};
use crate::session::timer::{TimerKind, TimerRequest};
use crate::session::{Error, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has been sent yet.
    Idle,
    /// `CONNECT` sent, waiting for `CONNACK`.
    Connecting,
    Connected,
    /// `DISCONNECT` sent or received.
    Disconnecting,
    Closed,
}

/// An effect requested by the [`Engine`], consumed in order by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Serialize and write `packet`. If the write fails, `release_on_failure` must be handed back
    /// through [`Engine::release_packet_id`] before the failure is reported.
    Send {
        packet: Packet,
        release_on_failure: Option<u16>,
    },
    /// A valid packet arrived from the server.
    Received(Packet),
    /// A packet arrived that does not belong to any known flow and was dropped.
    Discarded(Packet),
    Timer(TimerRequest),
    PacketIdReleased(u16),
    /// The session is ending; the transport should be closed.
    Close,
}

/// MQTT 3.1.1 client protocol state.
///
/// The engine performs no I/O. Every operation validates its input against the current phase and
/// the in-flight flows, then queues [`Event`]s that the caller drains with [`Engine::poll_event`].
#[derive(Debug)]
pub struct Engine {
    protocol: Protocol,
    config: SessionConfig,
    phase: Phase,
    auto_ack: bool,
    ids: PacketIdPool,
    /// QoS 2 publishes received and not yet released by `PUBREL`.
    incoming_qos2: HashSet<u16>,
    ping_outstanding: bool,
    keep_alive_armed: bool,
    retry_armed: bool,
    events: VecDeque<Event>,
}

impl Engine {
    pub fn new(protocol: Protocol, config: SessionConfig) -> Self {
        Self {
            protocol,
            config,
            phase: Phase::Idle,
            auto_ack: false,
            ids: PacketIdPool::new(32),
            incoming_qos2: HashSet::new(),
            ping_outstanding: false,
            keep_alive_armed: false,
            retry_armed: false,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    /// Acknowledge received publishes without the embedder's involvement.
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn acquire_packet_id(&mut self) -> Result<u16, Error> {
        self.ids.acquire().ok_or(Error::NoPacketIdAvailable)
    }

    /// Return `packet_id` to the pool. Returns `false` if it was not in use.
    pub fn release_packet_id(&mut self, packet_id: u16) -> bool {
        match self.ids.release(packet_id) {
            Some(_) => {
                self.events.push_back(Event::PacketIdReleased(packet_id));
                self.stop_retry_if_idle();
                true
            }
            None => false,
        }
    }

    pub fn packet_id_in_use(&self, packet_id: u16) -> bool {
        self.ids.contains(packet_id)
    }

    pub fn flow(&self, packet_id: u16) -> Option<&Flow> {
        self.ids.get(packet_id)
    }

    /// Number of packet identifiers bound to an outgoing flow.
    pub fn in_flight(&self) -> usize {
        self.ids.bound_len()
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        let connect = self.config.as_connect(self.protocol.clone());
        match self.phase {
            Phase::Idle => {}
            Phase::Closed => return Err(Error::SessionClosed),
            _ => return Err(Error::UnexpectedPacket(Packet::Connect(connect))),
        }
        if self.protocol != Protocol::V4 {
            return Err(Error::UnsupportedProtocol(self.protocol.clone()));
        }

        self.phase = Phase::Connecting;
        self.queue_send(Packet::Connect(connect), None);
        Ok(())
    }

    /// Validate an outgoing packet and queue it for sending.
    ///
    /// QoS 1/2 publishes, subscribes and unsubscribes must carry an identifier obtained from
    /// [`Engine::acquire_packet_id`] that is not yet bound to another packet.
    pub fn send(&mut self, packet: Packet) -> Result<(), Error> {
        match self.phase {
            Phase::Connected => {}
            Phase::Closed => return Err(Error::SessionClosed),
            _ => return Err(Error::NotConnected),
        }

        if !client_sendable(&packet) {
            return Err(Error::UnexpectedPacket(packet));
        }
        let release_on_failure = match &packet {
            Packet::Publish(publish) => self.bind_publish(publish)?,
            Packet::Subscribe(subscribe) => {
                self.bind(subscribe.pkid, Flow::AwaitingSubAck)?;
                Some(subscribe.pkid)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.bind(unsubscribe.pkid, Flow::AwaitingUnsubAck)?;
                Some(unsubscribe.pkid)
            }
            _ => None,
        };

        let disconnect = matches!(packet, Packet::Disconnect);
        let acked_publish = matches!(&packet, Packet::Publish(p) if p.qos != QoS::AtMostOnce);
        self.queue_send(packet, release_on_failure);
        if acked_publish {
            self.arm_retry();
        }
        if disconnect {
            self.phase = Phase::Disconnecting;
            self.events.push_back(Event::Close);
        }
        Ok(())
    }

    /// Process a packet received from the server.
    pub fn receive(&mut self, packet: Packet) -> Result<(), Error> {
        match self.phase {
            Phase::Connected | Phase::Disconnecting => {}
            Phase::Connecting => {
                return match packet {
                    Packet::ConnAck(connack) => {
                        self.receive_connack(connack);
                        Ok(())
                    }
                    other => Err(Error::NotConnack(other)),
                }
            }
            Phase::Idle => return Err(Error::UnexpectedPacket(packet)),
            Phase::Closed => return Err(Error::SessionClosed),
        }

        match packet {
            Packet::Publish(publish) => self.receive_publish(publish),
            Packet::PubAck(ack) => {
                let pkid = ack.pkid;
                self.complete_if(pkid, Packet::PubAck(ack), |flow| {
                    matches!(flow, Flow::AwaitingPubAck(_))
                })
            }
            Packet::PubRec(rec) => self.receive_pubrec(rec),
            Packet::PubRel(rel) => self.receive_pubrel(rel),
            Packet::PubComp(comp) => {
                let pkid = comp.pkid;
                self.complete_if(pkid, Packet::PubComp(comp), |flow| {
                    matches!(flow, Flow::AwaitingPubComp)
                })
            }
            Packet::SubAck(ack) => {
                let pkid = ack.pkid;
                self.complete_if(pkid, Packet::SubAck(ack), |flow| {
                    matches!(flow, Flow::AwaitingSubAck)
                })
            }
            Packet::UnsubAck(ack) => {
                let pkid = ack.pkid;
                self.complete_if(pkid, Packet::UnsubAck(ack), |flow| {
                    matches!(flow, Flow::AwaitingUnsubAck)
                })
            }
            Packet::PingResp => {
                self.ping_outstanding = false;
                self.events.push_back(Event::Received(Packet::PingResp));
            }
            Packet::Disconnect => {
                self.phase = Phase::Disconnecting;
                self.events.push_back(Event::Received(Packet::Disconnect));
                self.events.push_back(Event::Close);
            }
            Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq => return Err(Error::UnexpectedPacket(packet)),
        }

        Ok(())
    }

    /// React to the expiry of a timer previously requested through [`Event::Timer`].
    pub fn timer_expired(&mut self, kind: TimerKind) -> Result<(), Error> {
        match kind {
            TimerKind::KeepAlive => {
                self.keep_alive_armed = false;
                match self.phase {
                    Phase::Connecting => Err(Error::ConnackTimeout),
                    Phase::Connected if self.ping_outstanding => Err(Error::KeepAliveTimeout),
                    Phase::Connected => {
                        self.queue_send(Packet::PingReq, None);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            TimerKind::Retry => {
                self.retry_armed = false;
                if self.phase != Phase::Connected {
                    return Ok(());
                }
                let resend: Vec<Packet> = self
                    .ids
                    .bound()
                    .filter_map(|(packet_id, flow)| match flow {
                        Flow::AwaitingPubAck(publish) | Flow::AwaitingPubRec(publish) => {
                            let mut publish = publish.clone();
                            publish.dup = true;
                            Some(Packet::Publish(publish))
                        }
                        Flow::AwaitingPubComp => Some(Packet::PubRel(PubRel::new(packet_id))),
                        _ => None,
                    })
                    .collect();
                for packet in resend {
                    self.queue_send(packet, None);
                }
                if self.has_publish_flows() {
                    self.arm_retry();
                }
                Ok(())
            }
        }
    }

    /// The `DISCONNECT` queued by [`Engine::send`] never reached the transport. Go back to
    /// [`Phase::Connected`] so the session stays usable.
    pub fn disconnect_failed(&mut self) {
        if self.phase == Phase::Disconnecting {
            self.phase = Phase::Connected;
        }
    }

    /// Move to [`Phase::Closed`] and drop every pending event.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.events.clear();
        self.ping_outstanding = false;
        self.keep_alive_armed = false;
        self.retry_armed = false;
    }

    fn receive_connack(&mut self, connack: ConnAck) {
        if connack.code == ConnectReturnCode::Success {
            self.phase = Phase::Connected;
            self.events.push_back(Event::Received(Packet::ConnAck(connack)));
        } else {
            self.close();
            self.events.push_back(Event::Received(Packet::ConnAck(connack)));
        }
    }

    fn receive_publish(&mut self, publish: Publish) {
        let pkid = publish.pkid;
        match publish.qos {
            QoS::AtMostOnce => self.events.push_back(Event::Received(Packet::Publish(publish))),
            QoS::AtLeastOnce => {
                self.events.push_back(Event::Received(Packet::Publish(publish)));
                if self.auto_ack {
                    self.queue_send(Packet::PubAck(PubAck::new(pkid)), None);
                }
            }
            QoS::ExactlyOnce => {
                if self.incoming_qos2.insert(pkid) {
                    self.events.push_back(Event::Received(Packet::Publish(publish)));
                } else {
                    self.events.push_back(Event::Discarded(Packet::Publish(publish)));
                }
                if self.auto_ack {
                    self.queue_send(Packet::PubRec(PubRec::new(pkid)), None);
                }
            }
        }
    }

    fn receive_pubrec(&mut self, rec: PubRec) {
        let pkid = rec.pkid;
        match self.ids.get_mut(pkid) {
            Some(flow @ Flow::AwaitingPubRec(_)) => {
                *flow = Flow::AwaitingPubComp;
                self.events.push_back(Event::Received(Packet::PubRec(rec)));
                self.queue_send(Packet::PubRel(PubRel::new(pkid)), None);
            }
            // Our PUBREL got lost or the server retransmitted; answer again.
            Some(Flow::AwaitingPubComp) => {
                self.events.push_back(Event::Discarded(Packet::PubRec(rec)));
                self.queue_send(Packet::PubRel(PubRel::new(pkid)), None);
            }
            _ => self.events.push_back(Event::Discarded(Packet::PubRec(rec))),
        }
    }

    fn receive_pubrel(&mut self, rel: PubRel) {
        let pkid = rel.pkid;
        if self.incoming_qos2.remove(&pkid) {
            self.events.push_back(Event::Received(Packet::PubRel(rel)));
        } else {
            self.events.push_back(Event::Discarded(Packet::PubRel(rel)));
        }
        // PUBCOMP is owed even for an unknown identifier.
        if self.auto_ack {
            self.queue_send(Packet::PubComp(PubComp::new(pkid)), None);
        }
    }

    /// Finish the flow of `packet_id` if `expected` matches its state, otherwise discard `packet`.
    fn complete_if<F>(&mut self, packet_id: u16, packet: Packet, expected: F)
    where
        F: FnOnce(&Flow) -> bool,
    {
        match self.ids.get(packet_id) {
            Some(flow) if expected(flow) => {
                self.release_packet_id(packet_id);
                self.events.push_back(Event::Received(packet));
            }
            _ => self.events.push_back(Event::Discarded(packet)),
        }
    }

    fn bind_publish(&mut self, publish: &Publish) -> Result<Option<u16>, Error> {
        let pkid = publish.pkid;
        let flow = match publish.qos {
            QoS::AtMostOnce if pkid == 0 => return Ok(None),
            qos @ QoS::AtMostOnce => return Err(Error::InvalidPacketId(pkid, qos)),
            qos if pkid == 0 => return Err(Error::InvalidPacketId(pkid, qos)),
            QoS::AtLeastOnce => Flow::AwaitingPubAck(publish.clone()),
            QoS::ExactlyOnce => Flow::AwaitingPubRec(publish.clone()),
        };
        self.bind(pkid, flow)?;
        Ok(Some(pkid))
    }

    fn bind(&mut self, packet_id: u16, flow: Flow) -> Result<(), Error> {
        match self.ids.get_mut(packet_id) {
            Some(slot) if slot.is_reserved() => {
                *slot = flow;
                Ok(())
            }
            Some(_) => Err(Error::PacketIdInFlight(packet_id)),
            None => Err(Error::PacketIdNotAcquired(packet_id)),
        }
    }

    fn queue_send(&mut self, packet: Packet, release_on_failure: Option<u16>) {
        let ping = matches!(packet, Packet::PingReq);
        self.events.push_back(Event::Send {
            packet,
            release_on_failure,
        });

        // While a PINGREQ is outstanding the keep alive timer is its response deadline.
        if ping || !self.ping_outstanding {
            self.restart_keep_alive();
        }
        if ping {
            self.ping_outstanding = true;
        }
    }

    fn restart_keep_alive(&mut self) {
        let keep_alive = self.config.keep_alive();
        if keep_alive.is_zero() {
            return;
        }
        let request = if self.keep_alive_armed {
            TimerRequest::reset(TimerKind::KeepAlive, keep_alive)
        } else {
            TimerRequest::start(TimerKind::KeepAlive, keep_alive)
        };
        self.keep_alive_armed = true;
        self.events.push_back(Event::Timer(request));
    }

    fn arm_retry(&mut self) {
        let interval = self.config.retry_interval;
        if interval.is_zero() || self.retry_armed {
            return;
        }
        self.retry_armed = true;
        self.events
            .push_back(Event::Timer(TimerRequest::start(TimerKind::Retry, interval)));
    }

    fn stop_retry_if_idle(&mut self) {
        if self.retry_armed && !self.has_publish_flows() {
            self.retry_armed = false;
            self.events
                .push_back(Event::Timer(TimerRequest::stop(TimerKind::Retry)));
        }
    }

    fn has_publish_flows(&self) -> bool {
        self.ids.bound().any(|(_, flow)| {
            matches!(
                flow,
                Flow::AwaitingPubAck(_) | Flow::AwaitingPubRec(_) | Flow::AwaitingPubComp
            )
        })
    }
}

fn client_sendable(packet: &Packet) -> bool {
    match packet {
        Packet::Publish(_)
        | Packet::PubAck(_)
        | Packet::PubRec(_)
        | Packet::PubRel(_)
        | Packet::PubComp(_)
        | Packet::Subscribe(_)
        | Packet::Unsubscribe(_)
        | Packet::PingReq
        | Packet::Disconnect => true,
        Packet::Connect(_)
        | Packet::ConnAck(_)
        | Packet::SubAck(_)
        | Packet::UnsubAck(_)
        | Packet::PingResp => false,
    }
}
