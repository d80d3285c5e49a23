use mqttbytes::v4::{ConnAck, Packet, Publish, SubAck, Subscribe, Unsubscribe};
use mqttbytes::QoS;

use crate::session::engine::Engine;
use crate::session::Error;

/// Requests a [`Handler`] can make while reacting to a session event.
///
/// Packets are queued on the engine and written once the handler returns, in the order they
/// were requested.
pub struct Requests<'a> {
    engine: &'a mut Engine,
}

impl<'a> Requests<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn acquire_packet_id(&mut self) -> Result<u16, Error> {
        self.engine.acquire_packet_id()
    }

    pub fn release_packet_id(&mut self, packet_id: u16) -> bool {
        self.engine.release_packet_id(packet_id)
    }

    pub fn send(&mut self, packet: Packet) -> Result<(), Error> {
        self.engine.send(packet)
    }

    /// Publish `payload` to `topic`, acquiring a packet identifier for QoS 1 and 2.
    ///
    /// Returns the identifier used, if any.
    pub fn publish<S, P>(&mut self, topic: S, payload: P, qos: QoS) -> Result<Option<u16>, Error>
    where
        S: Into<String>,
        P: Into<Vec<u8>>,
    {
        let mut publish = Publish::new(topic, qos, payload);
        if qos == QoS::AtMostOnce {
            self.engine.send(Packet::Publish(publish))?;
            return Ok(None);
        }

        let packet_id = self.engine.acquire_packet_id()?;
        publish.pkid = packet_id;
        self.send_with_id(Packet::Publish(publish), packet_id)?;
        Ok(Some(packet_id))
    }

    pub fn subscribe<S: Into<String>>(&mut self, filter: S, qos: QoS) -> Result<u16, Error> {
        let packet_id = self.engine.acquire_packet_id()?;
        let mut subscribe = Subscribe::new(filter, qos);
        subscribe.pkid = packet_id;
        self.send_with_id(Packet::Subscribe(subscribe), packet_id)?;
        Ok(packet_id)
    }

    pub fn unsubscribe<S: Into<String>>(&mut self, topic: S) -> Result<u16, Error> {
        let packet_id = self.engine.acquire_packet_id()?;
        let mut unsubscribe = Unsubscribe::new(topic);
        unsubscribe.pkid = packet_id;
        self.send_with_id(Packet::Unsubscribe(unsubscribe), packet_id)?;
        Ok(packet_id)
    }

    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.engine.send(Packet::Disconnect)
    }

    fn send_with_id(&mut self, packet: Packet, packet_id: u16) -> Result<(), Error> {
        self.engine.send(packet).map_err(|e| {
            self.engine.release_packet_id(packet_id);
            e
        })
    }
}

/// Embedder policy layered on top of a session.
///
/// Every method has a default that does nothing, so a handler only implements what it reacts to.
/// Errors returned from a handler are fatal to the session.
pub trait Handler {
    /// The server accepted the connection.
    fn on_connected(&mut self, _requests: &mut Requests<'_>, _connack: &ConnAck) -> Result<(), Error> {
        Ok(())
    }

    fn on_publish(&mut self, _requests: &mut Requests<'_>, _publish: &Publish) -> Result<(), Error> {
        Ok(())
    }

    fn on_puback(&mut self, _requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        Ok(())
    }

    fn on_pubrec(&mut self, _requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        Ok(())
    }

    fn on_pubrel(&mut self, _requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        Ok(())
    }

    fn on_pubcomp(&mut self, _requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        Ok(())
    }

    fn on_suback(&mut self, _requests: &mut Requests<'_>, _suback: &SubAck) -> Result<(), Error> {
        Ok(())
    }

    fn on_unsuback(&mut self, _requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        Ok(())
    }

    /// `packet_id` went back to the pool, either because its flow completed or its send failed.
    fn on_packet_id_released(&mut self, _packet_id: u16) {}

    /// The session closed, with the error that caused it if any.
    fn on_closed(&mut self, _error: Option<&Error>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

/// Publishes a fixed list of messages once connected and disconnects after a QoS 2 flow
/// completes.
///
/// # Examples
///
/// ```
/// use mqttlink::session::PublishOnConnect;
/// use mqttlink::QoS;
///
/// let policy = PublishOnConnect::new()
///     .message("topic1", "payload1", QoS::AtMostOnce)
///     .message("topic2", "payload2", QoS::AtLeastOnce)
///     .message("topic3", "payload3", QoS::ExactlyOnce);
/// assert!(policy.packet_ids().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct PublishOnConnect {
    messages: Vec<(String, Vec<u8>, QoS)>,
    disconnect_after_pubcomp: bool,
    packet_ids: Vec<u16>,
    disconnected: bool,
}

impl PublishOnConnect {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            disconnect_after_pubcomp: true,
            packet_ids: Vec::new(),
            disconnected: false,
        }
    }

    pub fn message<S, P>(mut self, topic: S, payload: P, qos: QoS) -> Self
    where
        S: Into<String>,
        P: Into<Vec<u8>>,
    {
        self.messages.push((topic.into(), payload.into(), qos));
        self
    }

    pub fn disconnect_after_pubcomp(mut self, disconnect: bool) -> Self {
        self.disconnect_after_pubcomp = disconnect;
        self
    }

    /// Identifiers assigned to the QoS 1 and 2 messages, in publish order.
    pub fn packet_ids(&self) -> &[u16] {
        &self.packet_ids
    }
}

impl Default for PublishOnConnect {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for PublishOnConnect {
    fn on_connected(&mut self, requests: &mut Requests<'_>, _connack: &ConnAck) -> Result<(), Error> {
        for (topic, payload, qos) in &self.messages {
            if let Some(packet_id) = requests.publish(topic.clone(), payload.clone(), *qos)? {
                self.packet_ids.push(packet_id);
            }
        }
        Ok(())
    }

    fn on_pubcomp(&mut self, requests: &mut Requests<'_>, _packet_id: u16) -> Result<(), Error> {
        if self.disconnect_after_pubcomp && !self.disconnected {
            self.disconnected = true;
            requests.disconnect()?;
        }
        Ok(())
    }
}
