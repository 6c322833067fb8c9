use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tagcall_protocol::{EventKind, SignalingMessage};
use tokio::sync::mpsc;

struct SlotEntry {
    generation: u64,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct SlotTable {
    next_generation: u64,
    entries: HashMap<EventKind, SlotEntry>,
}

/// Dispatch table with a single consumer slot per event name.
///
/// Binding an event that already has a consumer replaces it: only the most
/// recent registration receives messages, and the displaced receiver's
/// stream simply ends. Slot registrations survive reconnects of the
/// underlying transport.
#[derive(Clone, Default)]
pub(crate) struct Slots {
    inner: Arc<Mutex<SlotTable>>,
}

impl Slots {
    pub(crate) fn bind(
        &self,
        kind: EventKind,
    ) -> (Binding, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.lock();
        table.next_generation += 1;
        let generation = table.next_generation;
        if table.entries.insert(kind, SlotEntry { generation, tx }).is_some() {
            tracing::debug!(?kind, "Replacing existing event binding");
        }

        (
            Binding {
                kind,
                generation,
                slots: self.clone(),
            },
            rx,
        )
    }

    fn unbind(&self, kind: EventKind, generation: u64) {
        let mut table = self.inner.lock();
        if table
            .entries
            .get(&kind)
            .is_some_and(|entry| entry.generation == generation)
        {
            table.entries.remove(&kind);
        }
    }

    pub(crate) fn dispatch(&self, msg: SignalingMessage) {
        let kind = msg.kind();
        let tx = self.inner.lock().entries.get(&kind).map(|entry| entry.tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::trace!(?kind, "Bound consumer gone, dropping message");
                }
            }
            None => tracing::trace!(?kind, "No consumer bound, dropping message"),
        }
    }
}

/// Guard for a bound event slot.
///
/// Dropping the guard unbinds the slot, unless a newer binding has already
/// taken it over. Holding the guard for exactly as long as the consumer
/// lives is what keeps stale handlers from piling up across calls.
pub struct Binding {
    kind: EventKind,
    generation: u64,
    slots: Slots,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.slots.unbind(self.kind, self.generation);
    }
}
