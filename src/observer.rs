//! Structured diagnostics emitted by a session.
//!
//! The session never writes to stdout or a logger directly; everything goes through an
//! [`Observer`]. [`LogObserver`] forwards events to the [`log`] facade and is the default.

use std::time::Duration;

use mqttbytes::v4::Packet;

use crate::packet::{packet_id, PacketKind};
use crate::session::{Error, TimerKind, TimerRequest};

#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    /// `packet` was written to the transport.
    Sent(&'a Packet),
    /// Writing `packet` failed.
    SendFailed(&'a Packet, &'a Error),
    Received(&'a Packet),
    /// `packet` arrived but belongs to no known flow.
    Discarded(&'a Packet),
    Timer(&'a TimerRequest),
    TimerFired(TimerKind),
    PacketIdReleased(u16),
    Error(&'a Error),
    Closed,
}

pub trait Observer {
    fn on_event(&mut self, event: SessionEvent<'_>);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&mut self, _event: SessionEvent<'_>) {}
}

/// Forwards events to the [`log`] facade.
///
/// Works whether or not a logger has been installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&mut self, event: SessionEvent<'_>) {
        match event {
            SessionEvent::Sent(packet) => {
                log::debug!("Sent {}{}", PacketKind::of(packet), PacketId(packet));
                log::trace!("Sent {:?}", packet);
            }
            SessionEvent::SendFailed(packet, error) => {
                log::warn!(
                    "Failed to send {}{}: {}",
                    PacketKind::of(packet),
                    PacketId(packet),
                    error
                );
            }
            SessionEvent::Received(Packet::Publish(publish)) => {
                log::debug!(
                    "PUBLISH received pid:{} topic:{} qos:{:?} retain:{} dup:{} payload:{} bytes",
                    publish.pkid,
                    publish.topic,
                    publish.qos,
                    publish.retain,
                    publish.dup,
                    publish.payload.len()
                );
            }
            SessionEvent::Received(packet) => {
                log::debug!("{} received{}", PacketKind::of(packet), PacketId(packet));
            }
            SessionEvent::Discarded(packet) => {
                log::warn!(
                    "Discarding {}{} for unknown flow",
                    PacketKind::of(packet),
                    PacketId(packet)
                );
            }
            SessionEvent::Timer(request) => {
                log::trace!(
                    "Timer op:{:?} kind:{} ms:{:?}",
                    request.op,
                    request.kind,
                    request.duration.as_ref().map(Duration::as_millis)
                );
            }
            SessionEvent::TimerFired(kind) => log::debug!("{} timer fired", kind),
            SessionEvent::PacketIdReleased(packet_id) => {
                log::trace!("Packet id {} released", packet_id)
            }
            SessionEvent::Error(error) => log::warn!("Session error: {}", error),
            SessionEvent::Closed => log::debug!("Session closed"),
        }
    }
}

struct PacketId<'a>(&'a Packet);

impl std::fmt::Display for PacketId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match packet_id(self.0) {
            Some(id) => write!(f, " pid:{}", id),
            None => Ok(()),
        }
    }
}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn on_event(&mut self, event: SessionEvent<'_>) {
        (**self).on_event(event)
    }
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn on_event(&mut self, event: SessionEvent<'_>) {
        (**self).on_event(event)
    }
}
