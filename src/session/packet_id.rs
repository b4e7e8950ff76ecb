use crate::session::task::CommandResultTx;
use crate::session::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    SubAck,
    UnsubAck,
}

/// A request that is parked until the broker acknowledges its packet id.
pub struct WaitingAck {
    kind: AckKind,
    response: CommandResultTx<(), RequestError>,
}

impl WaitingAck {
    pub fn new(kind: AckKind, response: CommandResultTx<(), RequestError>) -> Self {
        Self { kind, response }
    }

    pub fn resolve(self, res: Result<(), RequestError>) {
        let _ = self.response.0.send(res);
    }
}

pub struct WaitAckSlots {
    slab: slab::Slab<WaitingAck>,
}

impl WaitAckSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            slab: slab::Slab::with_capacity(capacity),
        }
    }

    /// Park `ack` and hand out the packet id it is waiting on.
    ///
    /// Packet id 0 is reserved by MQTT, so slab key `k` maps to id `k + 1`.
    pub fn try_insert(&mut self, ack: WaitingAck) -> Result<u16, WaitingAck> {
        let entry = self.slab.vacant_entry();
        let key = entry.key();

        if key < 65535 {
            entry.insert(ack);
            Ok((key + 1) as u16)
        } else {
            Err(ack)
        }
    }

    pub fn take(&mut self, kind: AckKind, packet_id: u16) -> Option<WaitingAck> {
        if packet_id == 0 {
            return None;
        }
        let key: usize = (packet_id - 1).into();
        if self.slab.get(key)?.kind == kind {
            Some(self.slab.remove(key))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Resolve every parked request with `err`, used when the session stops.
    pub fn fail_all(&mut self, err: RequestError) {
        for ack in self.slab.drain() {
            ack.resolve(Err(err.clone()));
        }
    }
}
