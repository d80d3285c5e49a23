use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mqttbytes::v4::Packet;
use tokio_util::codec::Encoder;

use crate::codec::Codec;
use crate::observer::{Observer, SessionEvent};
use crate::packet::PacketKind;
use crate::transport::Transport;

pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::new();
    Codec::default()
        .encode(packet, &mut buf)
        .expect("encodable packet");
    buf.freeze()
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Accept one byte less than asked.
    Short,
    Os(i32),
}

#[derive(Default)]
struct State {
    inbound: VecDeque<Vec<u8>>,
    eof: bool,
    sent: Vec<Vec<u8>>,
    send_attempts: usize,
    close_calls: usize,
    failures: HashMap<usize, Failure>,
    send_delay: Option<Duration>,
}

/// Scripted in-memory transport. Clones share state, so a test keeps one handle while the session
/// owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn push_bytes(&self, bytes: Vec<u8>) {
        self.state().inbound.push_back(bytes);
    }

    pub fn push_packet(&self, packet: &Packet) {
        self.push_bytes(encode(packet).to_vec());
    }

    /// Report end of stream once every scripted chunk has been read. Without this, reads pend
    /// forever after the script runs out.
    pub fn eof_when_drained(&self) {
        self.state().eof = true;
    }

    /// Fail send attempt number `attempt`, counting from zero.
    pub fn fail_send(&self, attempt: usize, failure: Failure) {
        self.state().failures.insert(attempt, failure);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = Some(delay);
    }

    /// Buffers handed to successful sends.
    pub fn sent_buffers(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent_buffers()
            .into_iter()
            .map(|buf| {
                let mut buf = BytesMut::from(&buf[..]);
                let packet = mqttbytes::v4::read(&mut buf, usize::MAX).unwrap();
                assert!(buf.is_empty(), "one packet per send");
                packet
            })
            .collect()
    }

    pub fn send_attempts(&self) -> usize {
        self.state().send_attempts
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (delay, failure) = {
            let mut state = self.state();
            let attempt = state.send_attempts;
            state.send_attempts += 1;
            (state.send_delay, state.failures.remove(&attempt))
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(Failure::Short) => Ok(buf.len().saturating_sub(1)),
            Some(Failure::Os(code)) => Err(io::Error::from_raw_os_error(code)),
            None => {
                self.state().sent.push(buf.to_vec());
                Ok(buf.len())
            }
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (chunk, eof) = {
            let mut state = self.state();
            let chunk = state.inbound.pop_front().map(|mut chunk| {
                if chunk.len() > buf.len() {
                    let rest = chunk.split_off(buf.len());
                    state.inbound.push_front(rest);
                }
                chunk
            });
            (chunk, state.eof)
        };

        match chunk {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None if eof => Ok(0),
            None => futures::future::pending().await,
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.state().close_calls += 1;
        Ok(())
    }
}

/// Observer that keeps a short text line per event.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<String>,
}

impl EventLog {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Observer for EventLog {
    fn on_event(&mut self, event: SessionEvent<'_>) {
        let entry = match event {
            SessionEvent::Sent(packet) => format!("sent {}", PacketKind::of(packet)),
            SessionEvent::SendFailed(packet, _) => format!("send failed {}", PacketKind::of(packet)),
            SessionEvent::Received(packet) => format!("received {}", PacketKind::of(packet)),
            SessionEvent::Discarded(packet) => format!("discarded {}", PacketKind::of(packet)),
            SessionEvent::Timer(request) => format!("timer {:?} {}", request.op, request.kind),
            SessionEvent::TimerFired(kind) => format!("fired {}", kind),
            SessionEvent::PacketIdReleased(packet_id) => format!("released {}", packet_id),
            SessionEvent::Error(error) => format!("error {}", error),
            SessionEvent::Closed => "closed".to_string(),
        };
        self.entries.push(entry);
    }
}
