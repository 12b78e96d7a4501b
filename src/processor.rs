//! The user-facing processing capability and the helpers handed to it.

use crate::message::{IncomingMessage, OutgoingMessage};

/// User-supplied processing function of a topic processor.
///
/// This is where all the work happens: populate a state store, emit output
/// messages through `sender`, or both. One instance is created per assigned
/// partition and the runtime guarantees no concurrent calls for the same
/// partition, so implementations are free to keep per-partition state without
/// locking.
pub trait MessageProcessor: Send {
    fn process(
        &mut self,
        message: &IncomingMessage,
        sender: &mut Sender,
        coordinator: &mut Coordinator,
    );
}

/// Collects the output messages emitted while processing a single input
/// message. Messages are submitted to the producer in the order they were
/// sent.
pub struct Sender {
    outgoing: Vec<OutgoingMessage>,
}

impl Sender {
    pub(crate) fn new() -> Self {
        Sender {
            outgoing: Vec::new(),
        }
    }

    /// Queue an output message for production.
    pub fn send(&mut self, message: OutgoingMessage) {
        self.outgoing.push(message);
    }

    pub(crate) fn into_messages(self) -> Vec<OutgoingMessage> {
        self.outgoing
    }
}

/// Lets user code synchronize with the runtime while processing a message.
pub struct Coordinator {
    must_commit: bool,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        Coordinator { must_commit: false }
    }

    /// Request a commit synchronized on the current message: its offset is
    /// marked once every output produced on this partition up to and
    /// including this message has been acknowledged, and no further input is
    /// processed until then.
    pub fn commit(&mut self) {
        self.must_commit = true;
    }

    pub(crate) fn must_commit(&self) -> bool {
        self.must_commit
    }
}
