use bytes::BytesMut;
use mqttbytes::v4::{ConnectReturnCode, Packet};
use mqttbytes::{Protocol, QoS};
use tokio_util::codec::Decoder;

use crate::codec::Codec;
use crate::observer::{LogObserver, Observer, SessionEvent};
use crate::packet::{byte_ranges, flatten};
use crate::session::engine::{Engine, Event, Phase};
use crate::session::handler::{Handler, NoopHandler, Requests};
use crate::session::timer::{TimerRequest, Timers};
use crate::session::{Error, SessionConfig};
use crate::transport::Transport;

const READ_CHUNK: usize = 4096;

/// A client session over one transport.
///
/// The session is not thread safe; all of its events (received frames, timer expiries, transport
/// errors) are processed sequentially by whoever drives it, normally [`Session::run`].
pub struct Session<T, H = NoopHandler, O = LogObserver> {
    transport: T,
    engine: Engine,
    timers: Timers,
    codec: Codec,
    read_buf: BytesMut,
    read_chunk: Vec<u8>,
    handler: H,
    observer: O,
    closed: bool,
}

impl<T: Transport> Session<T> {
    /// Create a session that owns `transport` and speaks `protocol`.
    ///
    /// Received publishes are acknowledged automatically. The default configuration has an empty
    /// client id; use [`Session::with_config`] to set one.
    ///
    /// Only [`Protocol::V4`] (MQTT 3.1.1) is implemented. Any other version fails on
    /// [`Session::start`] or [`Session::run`] with [`Error::UnsupportedProtocol`] before anything
    /// is sent.
    pub fn new(transport: T, protocol: Protocol) -> Self {
        let mut engine = Engine::new(protocol, SessionConfig::new(""));
        engine.set_auto_ack(true);

        Self {
            transport,
            engine,
            timers: Timers::new(),
            codec: Codec::default(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            read_chunk: vec![0; READ_CHUNK],
            handler: NoopHandler,
            observer: LogObserver,
            closed: false,
        }
    }
}

impl<T, H, O> Session<T, H, O> {
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.codec = Codec::new(config.max_packet_size);
        self.engine.set_config(config);
        self
    }

    pub fn with_handler<H2: Handler>(self, handler: H2) -> Session<T, H2, O> {
        Session {
            transport: self.transport,
            engine: self.engine,
            timers: self.timers,
            codec: self.codec,
            read_buf: self.read_buf,
            read_chunk: self.read_chunk,
            handler,
            observer: self.observer,
            closed: self.closed,
        }
    }

    pub fn with_observer<O2: Observer>(self, observer: O2) -> Session<T, H, O2> {
        Session {
            transport: self.transport,
            engine: self.engine,
            timers: self.timers,
            codec: self.codec,
            read_buf: self.read_buf,
            read_chunk: self.read_chunk,
            handler: self.handler,
            observer,
            closed: self.closed,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.engine.set_auto_ack(auto_ack);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T: Transport, H: Handler, O: Observer> Session<T, H, O> {
    /// Send `CONNECT`.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.engine.connect()?;
        self.process_events().await
    }

    /// Run the session until it closes.
    ///
    /// Sends `CONNECT` unless [`Session::start`] already did, then processes received frames and
    /// timer expiries in order. Any error closes the session and is returned. `Ok(())` means the
    /// session ended after a `DISCONNECT`.
    pub async fn run(&mut self) -> Result<(), Error> {
        let res = self.run_inner().await;
        if let Err(e) = &res {
            self.on_error(e).await;
        }
        res
    }

    /// Process bytes read from the transport by the caller. Errors close the session as in
    /// [`Session::run`].
    pub async fn feed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        self.read_buf.extend_from_slice(bytes);
        let res = self.process_frames().await;
        if let Err(e) = &res {
            self.on_error(e).await;
        }
        res
    }

    /// Send `packet` directly.
    ///
    /// A transport failure returns any identifier carried by `packet` to the pool and is reported
    /// without closing the session.
    pub async fn send(&mut self, packet: Packet) -> Result<(), Error> {
        self.ensure_open()?;
        self.engine.send(packet)?;
        self.process_events().await
    }

    /// Publish `payload` to `topic`, returning the packet identifier used for QoS 1 and 2.
    pub async fn publish<S, P>(&mut self, topic: S, payload: P, qos: QoS) -> Result<Option<u16>, Error>
    where
        S: Into<String>,
        P: Into<Vec<u8>>,
    {
        self.ensure_open()?;
        let res = Requests::new(&mut self.engine).publish(topic, payload, qos);
        self.process_events().await?;
        res
    }

    pub async fn subscribe<S: Into<String>>(&mut self, filter: S, qos: QoS) -> Result<u16, Error> {
        self.ensure_open()?;
        let res = Requests::new(&mut self.engine).subscribe(filter, qos);
        self.process_events().await?;
        res
    }

    pub async fn unsubscribe<S: Into<String>>(&mut self, topic: S) -> Result<u16, Error> {
        self.ensure_open()?;
        let res = Requests::new(&mut self.engine).unsubscribe(topic);
        self.process_events().await?;
        res
    }

    /// Send `DISCONNECT` and close the session.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.send(Packet::Disconnect).await
    }

    /// Close the transport without sending anything. Does nothing if already closed.
    pub async fn close(&mut self) {
        self.shutdown(None).await;
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.engine.phase() == Phase::Idle {
            self.start().await?;
        }

        while !self.closed {
            tokio::select! {
                read = self.transport.receive(&mut self.read_chunk) => {
                    let n = read?;
                    if n == 0 {
                        return self.on_eof().await;
                    }
                    self.read_buf.extend_from_slice(&self.read_chunk[..n]);
                    self.process_frames().await?;
                },
                kind = self.timers.wait() => {
                    self.observer.on_event(SessionEvent::TimerFired(kind));
                    self.engine.timer_expired(kind)?;
                    self.process_events().await?;
                },
            }
        }
        Ok(())
    }

    async fn process_frames(&mut self) -> Result<(), Error> {
        while !self.closed {
            match self.codec.decode(&mut self.read_buf)? {
                Some(packet) => {
                    self.engine.receive(packet)?;
                    self.process_events().await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn process_events(&mut self) -> Result<(), Error> {
        while let Some(event) = self.engine.poll_event() {
            match event {
                Event::Send {
                    packet,
                    release_on_failure,
                } => self.on_send(packet, release_on_failure).await?,
                Event::Received(packet) => self.on_receive(packet)?,
                Event::Discarded(packet) => self.observer.on_event(SessionEvent::Discarded(&packet)),
                Event::Timer(request) => self.on_timer_op(request),
                Event::PacketIdReleased(packet_id) => self.on_packet_id_release(packet_id),
                Event::Close => self.shutdown(None).await,
            }
        }
        Ok(())
    }

    async fn on_send(&mut self, packet: Packet, release_on_failure: Option<u16>) -> Result<(), Error> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        match self.write_packet(&packet).await {
            Ok(()) => {
                self.observer.on_event(SessionEvent::Sent(&packet));
                Ok(())
            }
            Err(e) => {
                if let Some(packet_id) = release_on_failure {
                    self.engine.release_packet_id(packet_id);
                }
                if matches!(packet, Packet::Disconnect) {
                    self.engine.disconnect_failed();
                }
                self.observer.on_event(SessionEvent::SendFailed(&packet, &e));
                self.abort_pending();
                Err(e)
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        let buf = flatten(&byte_ranges(packet)?);
        let sent = self.transport.send(&buf).await?;
        if sent != buf.len() {
            return Err(Error::ShortWrite {
                sent,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Drop every queued send after a failed one, returning their identifiers to the pool.
    fn abort_pending(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                Event::Send {
                    release_on_failure: Some(packet_id),
                    ..
                } => {
                    self.engine.release_packet_id(packet_id);
                }
                Event::Send { .. } | Event::Close => {}
                Event::Received(packet) | Event::Discarded(packet) => {
                    self.observer.on_event(SessionEvent::Discarded(&packet))
                }
                Event::Timer(request) => self.on_timer_op(request),
                Event::PacketIdReleased(packet_id) => self.on_packet_id_release(packet_id),
            }
        }
    }

    fn on_receive(&mut self, packet: Packet) -> Result<(), Error> {
        self.observer.on_event(SessionEvent::Received(&packet));

        let mut requests = Requests::new(&mut self.engine);
        match packet {
            Packet::ConnAck(connack) => {
                if connack.code != ConnectReturnCode::Success {
                    return Err(Error::ConnectionRejected(connack.code));
                }
                self.handler.on_connected(&mut requests, &connack)
            }
            Packet::Publish(publish) => self.handler.on_publish(&mut requests, &publish),
            Packet::PubAck(ack) => self.handler.on_puback(&mut requests, ack.pkid),
            Packet::PubRec(rec) => self.handler.on_pubrec(&mut requests, rec.pkid),
            Packet::PubRel(rel) => self.handler.on_pubrel(&mut requests, rel.pkid),
            Packet::PubComp(comp) => self.handler.on_pubcomp(&mut requests, comp.pkid),
            Packet::SubAck(suback) => self.handler.on_suback(&mut requests, &suback),
            Packet::UnsubAck(ack) => self.handler.on_unsuback(&mut requests, ack.pkid),
            Packet::PingResp | Packet::Disconnect => Ok(()),
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PingReq => {
                Ok(())
            }
        }
    }

    fn on_timer_op(&mut self, request: TimerRequest) {
        self.observer.on_event(SessionEvent::Timer(&request));
        self.timers.apply(request);
    }

    fn on_packet_id_release(&mut self, packet_id: u16) {
        self.observer.on_event(SessionEvent::PacketIdReleased(packet_id));
        self.handler.on_packet_id_released(packet_id);
    }

    async fn on_eof(&mut self) -> Result<(), Error> {
        if self.engine.phase() == Phase::Disconnecting {
            self.shutdown(None).await;
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    async fn on_error(&mut self, error: &Error) {
        if self.closed {
            return;
        }
        self.observer.on_event(SessionEvent::Error(error));
        self.shutdown(Some(error)).await;
    }

    async fn shutdown(&mut self, error: Option<&Error>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.timers.cancel_all();
        self.engine.close();
        if let Err(e) = self.transport.close().await {
            self.observer.on_event(SessionEvent::Error(&Error::IoError(e)));
        }
        self.observer.on_event(SessionEvent::Closed);
        self.handler.on_closed(error);
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use mqttbytes::v4::*;
    use mqttbytes::{Protocol, QoS};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    use super::Session;
    use crate::codec::Codec;
    use crate::session::{
        Error, Handler, NoopHandler, Phase, PublishOnConnect, Requests, SessionConfig,
    };
    use crate::test_util::{EventLog, Failure, MockTransport};
    use crate::transport::IoTransport;

    fn connack(code: ConnectReturnCode) -> Packet {
        Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        })
    }

    fn reference_policy() -> PublishOnConnect {
        PublishOnConnect::new()
            .message("topic1", "payload1", QoS::AtMostOnce)
            .message("topic2", "payload2", QoS::AtLeastOnce)
            .message("topic3", "payload3", QoS::ExactlyOnce)
    }

    fn mock_session(
        mock: &MockTransport,
        config: SessionConfig,
    ) -> Session<MockTransport, PublishOnConnect, EventLog> {
        Session::new(mock.clone(), Protocol::V4)
            .with_config(config)
            .with_handler(reference_policy())
            .with_observer(EventLog::default())
    }

    fn publishes(packets: &[Packet]) -> Vec<&Publish> {
        packets
            .iter()
            .filter_map(|p| match p {
                Packet::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn publishes_after_connack() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));
        mock.eof_when_drained();

        let mut session = mock_session(&mock, SessionConfig::new("client"));
        let res = session.run().await;
        assert!(matches!(res, Err(Error::ConnectionClosed)));

        let sent = mock.sent_packets();
        assert!(matches!(&sent[0], Packet::Connect(c) if c.client_id == "client"));
        let publishes = publishes(&sent);
        assert_eq!(publishes.len(), 3);

        assert_eq!(publishes[0].topic, "topic1");
        assert_eq!(publishes[0].qos, QoS::AtMostOnce);
        assert_eq!(publishes[0].pkid, 0);

        assert_eq!(publishes[1].topic, "topic2");
        assert_eq!(publishes[1].qos, QoS::AtLeastOnce);
        assert_eq!(publishes[2].topic, "topic3");
        assert_eq!(publishes[2].qos, QoS::ExactlyOnce);
        assert_ne!(publishes[1].pkid, 0);
        assert_ne!(publishes[2].pkid, 0);
        assert_ne!(publishes[1].pkid, publishes[2].pkid);
        assert_eq!(
            session.handler().packet_ids(),
            &[publishes[1].pkid, publishes[2].pkid]
        );
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn refused_connack_closes_without_publishing() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::NotAuthorized));

        let mut session = mock_session(&mock, SessionConfig::new("client"));
        let res = session.run().await;
        assert!(matches!(
            res,
            Err(Error::ConnectionRejected(ConnectReturnCode::NotAuthorized))
        ));

        assert_eq!(mock.sent_packets().len(), 1);
        assert!(publishes(&mock.sent_packets()).is_empty());
        assert_eq!(mock.close_calls(), 1);
        assert!(session.is_closed());
        assert!(session.handler().packet_ids().is_empty());
    }

    #[tokio::test]
    async fn short_write_releases_packet_id() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));
        // CONNECT, QoS 0 publish, then the QoS 1 publish comes up short.
        mock.fail_send(2, Failure::Short);

        let mut session = mock_session(&mock, SessionConfig::new("client"));
        let res = session.run().await;
        assert!(matches!(res, Err(Error::ShortWrite { .. })));
        assert!(res.unwrap_err().is_transport());

        let ids = session.handler().packet_ids().to_vec();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert!(!session.engine().packet_id_in_use(*id));
        }
        let log = session.observer().entries();
        let released = log.iter().position(|e| *e == format!("released {}", ids[0]));
        let error = log.iter().position(|e| e.starts_with("error"));
        assert!(released.unwrap() < error.unwrap());

        assert_eq!(mock.close_calls(), 1);
        assert_eq!(mock.send_attempts(), 3);
    }

    #[tokio::test]
    async fn qos2_completion_disconnects() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));
        // Identifiers are handed out from 1, so the QoS 2 publish gets 2.
        mock.push_packet(&Packet::PubRec(PubRec::new(2)));
        mock.push_packet(&Packet::PubComp(PubComp::new(2)));

        let mut session = mock_session(&mock, SessionConfig::new("client"));
        session.run().await.unwrap();

        let sent = mock.sent_packets();
        assert_eq!(publishes(&sent)[2].pkid, 2);
        assert_eq!(sent[sent.len() - 2], Packet::PubRel(PubRel::new(2)));
        assert_eq!(sent.last(), Some(&Packet::Disconnect));

        let released = session
            .observer()
            .entries()
            .iter()
            .filter(|e| *e == "released 2")
            .count();
        assert_eq!(released, 1);
        assert!(session.is_closed());
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn closed_session_is_terminal() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));
        mock.push_packet(&Packet::PingReq);

        let mut session = mock_session(&mock, SessionConfig::new("client"));
        let res = session.run().await;
        assert!(matches!(res, Err(Error::UnexpectedPacket(Packet::PingReq))));

        let attempts = mock.send_attempts();
        assert!(matches!(
            session.publish("late", "x", QoS::AtMostOnce).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.run().await, Err(Error::SessionClosed)));
        session.close().await;
        assert_eq!(mock.send_attempts(), attempts);
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn direct_send_failure_keeps_session_open() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), Protocol::V4)
            .with_config(SessionConfig::new("client"))
            .with_observer(EventLog::default());

        assert!(matches!(
            session.publish("early", "x", QoS::AtLeastOnce).await,
            Err(Error::NotConnected)
        ));
        assert!(!session.engine().packet_id_in_use(1));

        session.start().await.unwrap();
        session
            .feed(&mock_frame(&connack(ConnectReturnCode::Success)))
            .await
            .unwrap();

        mock.fail_send(1, Failure::Os(32));
        let err = session
            .publish("topic2", "payload2", QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(32));
        assert!(!session.engine().packet_id_in_use(1));
        assert!(!session.is_closed());
        assert_eq!(mock.close_calls(), 0);

        let pkid = session
            .publish("topic2", "payload2", QoS::AtLeastOnce)
            .await
            .unwrap()
            .unwrap();
        let mut expected = Publish::new("topic2", QoS::AtLeastOnce, "payload2");
        expected.pkid = pkid;
        let mut whole = BytesMut::new();
        expected.write(&mut whole).unwrap();
        assert_eq!(mock.sent_buffers().last().unwrap(), &whole[..]);
    }

    async fn connected_session(mock: &MockTransport) -> Session<MockTransport, NoopHandler, EventLog> {
        let mut session = Session::new(mock.clone(), Protocol::V4)
            .with_config(SessionConfig::new("client"))
            .with_observer(EventLog::default());
        session.start().await.unwrap();
        session
            .feed(&mock_frame(&connack(ConnectReturnCode::Success)))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn failed_disconnect_keeps_session_usable() {
        let mock = MockTransport::new();
        let mut session = connected_session(&mock).await;

        mock.fail_send(1, Failure::Os(32));
        let err = session.disconnect().await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(32));
        assert!(!session.is_closed());
        assert_eq!(session.engine().phase(), Phase::Connected);
        assert_eq!(mock.close_calls(), 0);

        session.publish("topic1", "payload1", QoS::AtMostOnce).await.unwrap();
        session.disconnect().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(mock.close_calls(), 1);
        assert_eq!(mock.sent_packets().last(), Some(&Packet::Disconnect));
    }

    #[tokio::test]
    async fn failed_subscribe_and_unsubscribe_release_ids() {
        let mock = MockTransport::new();
        let mut session = connected_session(&mock).await;

        mock.fail_send(1, Failure::Short);
        let err = session.subscribe("/cmd/#", QoS::AtLeastOnce).await.unwrap_err();
        assert!(matches!(err, Error::ShortWrite { .. }));
        assert_eq!(session.engine().in_flight(), 0);
        assert!(!session.engine().packet_id_in_use(1));

        mock.fail_send(2, Failure::Os(104));
        let err = session.unsubscribe("/cmd/#").await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(104));
        assert_eq!(session.engine().in_flight(), 0);
        assert!(!session.engine().packet_id_in_use(1));

        let released = session
            .observer()
            .entries()
            .iter()
            .filter(|e| *e == "released 1")
            .count();
        assert_eq!(released, 2);

        let pkid = session.subscribe("/cmd/#", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(pkid, 1);
        assert_eq!(session.engine().in_flight(), 1);
        assert!(!session.is_closed());
        assert_eq!(mock.close_calls(), 0);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), Protocol::V4)
            .with_config(SessionConfig::new("client"))
            .with_observer(EventLog::default());
        session.start().await.unwrap();
        session
            .feed(&mock_frame(&connack(ConnectReturnCode::Success)))
            .await
            .unwrap();

        let pkid = session.subscribe("/cmd/#", QoS::AtLeastOnce).await.unwrap();
        assert!(session.engine().packet_id_in_use(pkid));
        let suback = SubAck::new(pkid, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        session.feed(&mock_frame(&Packet::SubAck(suback))).await.unwrap();
        assert!(!session.engine().packet_id_in_use(pkid));

        let pkid = session.unsubscribe("/cmd/#").await.unwrap();
        session
            .feed(&mock_frame(&Packet::UnsubAck(UnsubAck::new(pkid))))
            .await
            .unwrap();
        assert!(!session.engine().packet_id_in_use(pkid));

        session.disconnect().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(mock.close_calls(), 1);
        assert_eq!(mock.sent_packets().last(), Some(&Packet::Disconnect));
    }

    #[derive(Default)]
    struct Recorder {
        topics: Vec<String>,
    }

    impl Handler for Recorder {
        fn on_publish(&mut self, requests: &mut Requests<'_>, publish: &Publish) -> Result<(), Error> {
            self.topics.push(publish.topic.clone());
            requests.publish(format!("echo/{}", publish.topic), "", QoS::AtMostOnce)?;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_order_is_kept_with_slow_sends() {
        let mock = MockTransport::new();
        mock.set_send_delay(Duration::from_millis(50));
        mock.push_packet(&connack(ConnectReturnCode::Success));

        let mut frames = BytesMut::new();
        for i in 0..10 {
            let publish = Publish::new(format!("t{}", i), QoS::AtMostOnce, vec![i as u8]);
            frames.extend_from_slice(&mock_frame(&Packet::Publish(publish)));
        }
        mock.push_bytes(frames.to_vec());
        mock.eof_when_drained();

        let mut session = Session::new(mock.clone(), Protocol::V4)
            .with_config(SessionConfig::new("client"))
            .with_handler(Recorder::default());
        assert!(matches!(session.run().await, Err(Error::ConnectionClosed)));

        let expected: Vec<String> = (0..10).map(|i| format!("t{}", i)).collect();
        assert_eq!(session.handler().topics, expected);
        let echoed: Vec<String> = publishes(&mock.sent_packets())
            .iter()
            .map(|p| p.topic.clone())
            .collect();
        let expected_echo: Vec<String> = expected.iter().map(|t| format!("echo/{}", t)).collect();
        assert_eq!(echoed, expected_echo);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_ping_then_timeout() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));

        let mut config = SessionConfig::new("client");
        config.set_keep_alive(Duration::from_secs(5));
        let mut session = Session::new(mock.clone(), Protocol::V4).with_config(config);

        let res = session.run().await;
        assert!(matches!(res, Err(Error::KeepAliveTimeout)));
        let sent = mock.sent_packets();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], Packet::PingReq);
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connack_timeout() {
        let mock = MockTransport::new();
        let mut config = SessionConfig::new("client");
        config.set_keep_alive(Duration::from_secs(5));
        let mut session = Session::new(mock.clone(), Protocol::V4).with_config(config);

        assert!(matches!(session.run().await, Err(Error::ConnackTimeout)));
        assert_eq!(mock.sent_packets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_publish_is_retransmitted() {
        let mock = MockTransport::new();
        mock.push_packet(&connack(ConnectReturnCode::Success));

        let mut config = SessionConfig::new("client");
        config.set_keep_alive(Duration::ZERO);
        config.retry_interval = Duration::from_secs(2);
        let mut session = Session::new(mock.clone(), Protocol::V4)
            .with_config(config)
            .with_handler(PublishOnConnect::new().message("topic2", "payload2", QoS::AtLeastOnce));

        let res = tokio::time::timeout(Duration::from_secs(5), session.run()).await;
        assert!(res.is_err());

        let sent = mock.sent_packets();
        let publishes = publishes(&sent);
        assert_eq!(publishes.len(), 3);
        assert!(!publishes[0].dup);
        assert!(publishes[1].dup && publishes[2].dup);
        assert!(publishes.iter().all(|p| p.pkid == publishes[0].pkid));
    }

    #[tokio::test]
    async fn unsupported_protocol() {
        let mock = MockTransport::new();
        let mut session = Session::new(mock.clone(), Protocol::V5);
        assert!(matches!(
            session.run().await,
            Err(Error::UnsupportedProtocol(Protocol::V5))
        ));
        assert_eq!(mock.send_attempts(), 0);
        assert_eq!(mock.close_calls(), 1);
    }

    fn mock_frame(packet: &Packet) -> Bytes {
        crate::test_util::encode(packet)
    }

    struct TestSession {
        stream: Framed<DuplexStream, Codec>,
        join: JoinHandle<Result<(), Error>>,
    }

    fn make_session(config: SessionConfig) -> TestSession {
        let (s, stream) = tokio::io::duplex(256);
        let join = tokio::spawn(async move {
            Session::new(IoTransport::new(s), Protocol::V4)
                .with_config(config)
                .run()
                .await
        });

        TestSession {
            stream: Framed::new(stream, Codec::default()),
            join,
        }
    }

    #[tokio::test]
    async fn first_message_is_connect() {
        let mut session = make_session(SessionConfig::new("hello-world"));

        let message = session.stream.next().await.unwrap().unwrap();
        assert_eq!(
            message,
            Packet::Connect(Connect {
                clean_session: false,
                keep_alive: 5 * 60,
                client_id: "hello-world".to_string(),
                login: None,
                protocol: mqttbytes::Protocol::V4,
                last_will: None
            })
        );
    }

    #[tokio::test]
    async fn disconnect_on_not_connack() {
        let packets = [
            Packet::PingResp,
            Packet::PingReq,
            Packet::Connect(Connect::new("hello")),
            Packet::Disconnect,
            Packet::PubAck(PubAck::new(10)),
            Packet::PubComp(PubComp::new(10)),
            Packet::PubRec(PubRec::new(10)),
            Packet::PubRel(PubRel::new(10)),
            Packet::Publish(Publish {
                pkid: 10,
                payload: Bytes::from_static(&[1]),
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "/hello".to_string(),
            }),
            Packet::Subscribe(Subscribe {
                pkid: 10,
                filters: vec![SubscribeFilter::new("/hello".to_string(), QoS::AtLeastOnce)],
            }),
            Packet::SubAck(SubAck::new(100, vec![SubscribeReasonCode::Failure])),
            Packet::Unsubscribe(Unsubscribe::new("/hello")),
            Packet::UnsubAck(UnsubAck::new(100)),
        ];

        for packet in &packets {
            let mut session = make_session(SessionConfig::new("hello-world"));
            let _connect = session.stream.next().await.unwrap().unwrap();
            session.stream.send(packet).await.unwrap();
            let none = session.stream.next().await;
            assert!(none.is_none());
            let task_res = session.join.await.unwrap().unwrap_err();
            match task_res {
                Error::NotConnack(x) => assert_eq!(x, *packet),
                x => panic!("Unexpected error {:?} for {:?}", x, *packet),
            }
        }
    }

    #[tokio::test]
    async fn ping_req_resp() {
        tokio::time::pause();

        let mut session = make_session(SessionConfig::new("hello-world"));
        let _connect = session.stream.next().await.unwrap().unwrap();
        session
            .stream
            .send(&connack(ConnectReturnCode::Success))
            .await
            .unwrap();

        // The paused clock advances on its own whenever both sides are idle.
        for _ in 0..100 {
            let before = tokio::time::Instant::now();
            let ping = session.stream.next().await.unwrap().unwrap();
            assert_eq!(ping, Packet::PingReq);
            assert!(before.elapsed() >= Duration::from_secs(5 * 60));
            session.stream.send(&Packet::PingResp).await.unwrap();
        }
        assert!(!session.join.is_finished());
    }
}
