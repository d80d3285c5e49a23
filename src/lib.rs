//! A small MQTT client session layer that is decoupled from the transport carrying its bytes.
//!
//! The crate binds an MQTT 3.1.1 protocol engine to anything implementing [`Transport`]. The
//! [`Session`] owns the transport, serializes outgoing packets into it, decodes incoming frames,
//! drives keep-alive and retransmission timers and closes the transport exactly once.
//!
//! ## Examples
//!
//! ```no_run
//! # tokio_test::block_on(async move {
//! use mqttlink::session::{PublishOnConnect, Session, SessionConfig};
//! use mqttlink::transport::IoTransport;
//! use mqttlink::{Protocol, QoS};
//!
//! let stream = tokio::net::TcpStream::connect("test.mosquitto.org:1883").await.unwrap();
//! let policy = PublishOnConnect::new()
//!     .message("mqttlink/hello", "payload", QoS::AtLeastOnce);
//! let mut session = Session::new(IoTransport::new(stream), Protocol::V4)
//!     .with_config(SessionConfig::new("mqttlink-client"))
//!     .with_handler(policy);
//! println!("Session result: {:?}", session.run().await);
//! # });
//! ```
//!
//! [`Transport`]: transport::Transport
//! [`Session`]: session::Session
pub mod endpoint;
pub mod observer;
pub mod packet;
pub mod session;
pub mod transport;

mod codec;
#[cfg(test)]
mod test_util;

pub use codec::{Codec, CodecError};
pub use mqttbytes::{Protocol, QoS};
