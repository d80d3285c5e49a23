use mqttbytes::v4::Publish;

/// What an allocated packet identifier is currently used for.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Acquired but not yet bound to a packet.
    Reserved,
    /// QoS 1 publish sent, waiting for `PUBACK`.
    AwaitingPubAck(Publish),
    /// QoS 2 publish sent, waiting for `PUBREC`.
    AwaitingPubRec(Publish),
    /// `PUBREL` sent, waiting for `PUBCOMP`.
    AwaitingPubComp,
    AwaitingSubAck,
    AwaitingUnsubAck,
}

impl Flow {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Flow::Reserved)
    }
}

/// Packet identifiers that are currently in use, each with the state of its flow.
///
/// Identifiers are `slab key + 1` so that `0` is never handed out.
#[derive(Debug)]
pub struct PacketIdPool {
    slab: slab::Slab<Flow>,
}

impl PacketIdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slab: slab::Slab::with_capacity(capacity),
        }
    }

    pub fn acquire(&mut self) -> Option<u16> {
        let entry = self.slab.vacant_entry();
        let key = entry.key();

        if key < u16::MAX as usize {
            entry.insert(Flow::Reserved);
            Some((key + 1) as u16)
        } else {
            None
        }
    }

    pub fn get(&self, packet_id: u16) -> Option<&Flow> {
        self.slab.get(Self::key(packet_id)?)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut Flow> {
        self.slab.get_mut(Self::key(packet_id)?)
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.get(packet_id).is_some()
    }

    /// Free `packet_id`, returning the flow it was used for.
    pub fn release(&mut self, packet_id: u16) -> Option<Flow> {
        let key = Self::key(packet_id)?;
        self.slab.try_remove(key)
    }

    /// Identifiers bound to a packet, in identifier order.
    pub fn bound(&self) -> impl Iterator<Item = (u16, &Flow)> {
        self.slab
            .iter()
            .filter(|(_, flow)| !flow.is_reserved())
            .map(|(key, flow)| ((key + 1) as u16, flow))
    }

    pub fn bound_len(&self) -> usize {
        self.bound().count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    fn key(packet_id: u16) -> Option<usize> {
        (packet_id != 0).then(|| usize::from(packet_id) - 1)
    }
}
