//! An MQTT client session bound to a [`Transport`](crate::transport::Transport).
//!
//! A [`Session`] owns one transport for its whole life. It serializes outgoing packets into the
//! transport, decodes incoming frames and hands them to the protocol [`Engine`], and reacts to the
//! engine's effects: bytes to send, packets that arrived, timers to arm and packet identifiers
//! that were released.
//!
//! ## Session states
//!
//! ### Initial setup
//!
//! Each session will perform the following actions before it is considered established:
//!
//!   1. Send [`CONNECT`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028)
//!   2. Wait for [`CONNACK`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033)
//!
//! Anything other than a `CONNACK` is a protocol error. A `CONNACK` that refuses the connection
//! closes the session. No ping requests are sent while waiting for `CONNACK`; if none arrives
//! within the keep alive interval the session fails.
//!
//! ### Operation of established sessions
//!
//! An established session will automatically send [`PINGREQ`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718081)
//! if a non-zero keep alive has been set and nothing else was sent within that interval.
//!
//! Received publishes are acknowledged automatically (`PUBACK` for QoS 1, `PUBREC`/`PUBCOMP` for
//! QoS 2). Outgoing QoS 1 and QoS 2 publishes are retransmitted with the `DUP` flag every
//! [`SessionConfig::retry_interval`] until their flow completes.
//!
//! ### Closing
//!
//! A session closes exactly once: on a transport error, a protocol error, a refused connection,
//! or after a `DISCONNECT` has been sent. The transport is closed at that point and timers are
//! cancelled. A closed session cannot be reused; create a new one to reconnect.
//!
//! ## Examples
//!
//! ```no_run
//! # tokio_test::block_on( async move {
//! use std::time::Duration;
//! use mqttlink::session::{Session, SessionConfig};
//! use mqttlink::transport::IoTransport;
//! use mqttlink::Protocol;
//! use tokio::net::TcpStream;
//!
//! let mut config = SessionConfig::new("mqttlink-client");
//! config.set_keep_alive(Duration::from_secs(5));
//!
//! let stream = TcpStream::connect("test.mosquitto.org:1883").await.unwrap();
//! let mut session = Session::new(IoTransport::new(stream), Protocol::V4).with_config(config);
//! // Run the session event loop. If/when this returns the session is closed.
//! println!("Session result: {:?}", session.run().await);
//! # });
//! ```

use std::time::Duration;

use mqttbytes::v4::{ConnectReturnCode, LastWill, Login, Packet};
use mqttbytes::Protocol;

use crate::codec::{CodecError, MAX_PACKET_SIZE};

mod adapter;
mod engine;
mod handler;
mod packet_id;
mod timer;

pub use adapter::Session;
pub use engine::{Engine, Event, Phase};
pub use handler::{Handler, NoopHandler, PublishOnConnect, Requests};
pub use packet_id::Flow;
pub use timer::{TimerKind, TimerOp, TimerRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Transport accepted {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
    #[error("MQTT protocol error: {0}")]
    ProtocolError(mqttbytes::Error),
    #[error("MQTT Connect rejected: {0:?}")]
    ConnectionRejected(ConnectReturnCode),
    #[error("CONNACK expected, got {0:?}")]
    NotConnack(Packet),
    #[error("Unexpected {0:?}")]
    UnexpectedPacket(Packet),
    #[error("Unsupported protocol version {0:?}")]
    UnsupportedProtocol(Protocol),
    #[error("No CONNACK within the keep alive interval")]
    ConnackTimeout,
    #[error("Keep alive timeout")]
    KeepAliveTimeout,
    #[error("No packet id available")]
    NoPacketIdAvailable,
    #[error("Packet id {0} was not acquired")]
    PacketIdNotAcquired(u16),
    #[error("Packet id {0} is already in flight")]
    PacketIdInFlight(u16),
    #[error("Invalid packet id {0} for {1:?}")]
    InvalidPacketId(u16, mqttbytes::QoS),
    #[error("The session is not connected")]
    NotConnected,
    #[error("The session is closed")]
    SessionClosed,
    #[error("Connection closed for unknown reason")]
    ConnectionClosed,
}

impl Error {
    /// `true` for failures reported by the transport itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::IoError(_) | Error::ShortWrite { .. })
    }

    /// The operating system error code behind a transport failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::IoError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(v: CodecError) -> Self {
        match v {
            CodecError::IoError(io) => io.into(),
            CodecError::ProtocolError(e) => Self::ProtocolError(e),
        }
    }
}

/// Configuration values for setting up a session
#[derive(Clone, PartialEq, Debug)]
pub struct SessionConfig {
    pub client_id: String,
    pub login: Option<Login>,
    pub last_will: Option<LastWill>,
    keep_alive: Duration,
    pub clean_session: bool,
    /// Interval between retransmissions of unacknowledged publishes. Zero disables them.
    pub retry_interval: Duration,
    pub max_packet_size: usize,
}

impl SessionConfig {
    /// Create a new [`SessionConfig`].
    ///
    /// The following default values are used:
    ///
    /// * `login`: `None`
    /// * `last_will`: `None`
    /// * `keep_alive`: 5 minutes
    /// * `clean_session`: `false`
    /// * `retry_interval`: 20 seconds
    /// * `max_packet_size`: 256 KiB
    ///
    /// `client_id` is not verified in any way to be conforming to the MQTT specification.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use mqttlink::session::SessionConfig;
    /// let config = SessionConfig::new("mqttlink-client");
    /// assert_eq!(config.client_id, "mqttlink-client");
    /// assert_eq!(config.keep_alive(), Duration::from_secs(5 * 60));
    /// assert_eq!(config.retry_interval, Duration::from_secs(20));
    /// ```
    pub fn new<S: ToString>(client_id: S) -> Self {
        SessionConfig {
            client_id: client_id.to_string(),
            login: None,
            last_will: None,
            keep_alive: Duration::from_secs(5 * 60),
            clean_session: false,
            retry_interval: Duration::from_secs(20),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Set the keep alive interval, truncated to whole seconds and clamped to `u16::MAX` seconds.
    ///
    /// A zero duration disables keep alive.
    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        let secs = keep_alive.as_secs().min(u16::MAX as u64);
        self.keep_alive = Duration::from_secs(secs);
    }

    pub(crate) fn as_connect(&self, protocol: Protocol) -> mqttbytes::v4::Connect {
        let mut connect = mqttbytes::v4::Connect::new(self.client_id.clone());
        connect.protocol = protocol;
        connect.clean_session = self.clean_session;
        connect.keep_alive = self.keep_alive.as_secs() as u16;
        connect.login = self.login.clone();
        connect.last_will = self.last_will.clone();
        connect
    }
}
