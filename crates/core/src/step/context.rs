//! Step mailboxes and the context a running step talks through
//!
//! Every step owns one unbounded inbound mailbox. Producers deliver an
//! independent copy of each emitted item to every wired destination; the
//! engine delivers a single [`Envelope::EndOfStream`] once all upstream
//! steps have terminated.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::definition::StepError;
use crate::data::{Data, Item, Kind};
use crate::representation::RepresentationRegistration;

/// Message carried by a mailbox
#[derive(Debug)]
pub enum Envelope {
    /// A data item
    Item(Item),

    /// No further items will arrive from any producer
    EndOfStream,
}

/// Result of [`StepContext::receive`]
#[derive(Debug)]
pub enum Received {
    /// An item of the requested kind
    Item(Item),

    /// All upstream steps have terminated and nothing matching is buffered
    EndOfStream,
}

impl Received {
    /// Convert into an `Option`, mapping end-of-stream to `None`
    pub fn into_item(self) -> Option<Item> {
        match self {
            Received::Item(item) => Some(item),
            Received::EndOfStream => None,
        }
    }
}

/// Sending half of a step mailbox
pub type MailboxSender = mpsc::UnboundedSender<Envelope>;

/// Receiving half of a step mailbox
pub type MailboxReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Create a new step mailbox
pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
    mpsc::unbounded_channel()
}

/// One downstream destination for a kind
#[derive(Debug, Clone)]
pub struct Route {
    /// Id of the destination step
    pub target: String,

    /// Destination mailbox
    pub sender: MailboxSender,
}

/// Wiring table of a step: where each produced kind goes
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    routes: HashMap<Kind, Vec<Route>>,
    renderers: Vec<RepresentationRegistration>,
}

impl Outputs {
    /// Empty wiring table (every emitted item is dropped)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination for a kind
    pub fn route(&mut self, kind: Kind, target: impl Into<String>, sender: MailboxSender) {
        self.routes.entry(kind).or_default().push(Route {
            target: target.into(),
            sender,
        });
    }

    /// Add a representation to render for wired representation consumers
    pub fn render_with(&mut self, registration: RepresentationRegistration) {
        self.renderers.push(registration);
    }

    /// Destinations for a kind
    pub fn routes(&self, kind: &Kind) -> &[Route] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn deliver(&self, item: &Item) -> usize {
        let mut delivered = 0;
        for route in self.routes(item.kind()) {
            // A closed mailbox means the consumer already terminated
            if route.sender.send(Envelope::Item(item.clone())).is_ok() {
                delivered += 1;
            } else {
                trace!(kind = %item.kind(), target = %route.target, "Destination mailbox closed");
            }
        }
        delivered
    }
}

/// Handle a running step uses to receive and emit items
pub struct StepContext {
    step_id: String,
    inbox: MailboxReceiver,
    buffer: VecDeque<Item>,
    exhausted: bool,
    outputs: Outputs,
}

impl StepContext {
    /// Create a context over a mailbox and a wiring table
    pub fn new(step_id: impl Into<String>, inbox: MailboxReceiver, outputs: Outputs) -> Self {
        Self {
            step_id: step_id.into(),
            inbox,
            buffer: VecDeque::new(),
            exhausted: false,
            outputs,
        }
    }

    /// Id of the running step
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Whether end-of-stream has been observed
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Wait for the next item of `kind`
    ///
    /// Items of other kinds that arrive first are buffered and handed out
    /// by later calls. Once end-of-stream has been seen, every call that
    /// finds nothing matching in the buffer returns immediately.
    pub async fn receive(&mut self, kind: &Kind) -> Received {
        if let Some(pos) = self.buffer.iter().position(|item| item.kind() == kind) {
            if let Some(item) = self.buffer.remove(pos) {
                return Received::Item(item);
            }
        }

        if self.exhausted {
            return Received::EndOfStream;
        }

        loop {
            match self.inbox.recv().await {
                Some(Envelope::Item(item)) if item.kind() == kind => {
                    return Received::Item(item);
                }
                Some(Envelope::Item(item)) => {
                    trace!(step_id = %self.step_id, kind = %item.kind(), "Buffering out-of-order item");
                    self.buffer.push_back(item);
                }
                Some(Envelope::EndOfStream) | None => {
                    debug!(step_id = %self.step_id, "End of stream");
                    self.exhausted = true;
                    return Received::EndOfStream;
                }
            }
        }
    }

    /// Wait for the next item of `T`'s kind and take its payload
    ///
    /// Returns `None` on end-of-stream.
    pub async fn receive_data<T: Data>(&mut self) -> Option<T> {
        loop {
            let item = self.receive(&T::KIND).await.into_item()?;
            match item.downcast::<T>() {
                Ok(value) => return Some(value),
                Err(other) => {
                    debug!(
                        step_id = %self.step_id,
                        kind = %other.kind(),
                        "Discarding item whose payload does not match its kind"
                    );
                }
            }
        }
    }

    /// Deliver an item to every wired destination
    ///
    /// Each destination receives its own copy. Representations of the
    /// item's kind are rendered for the destinations wired to them.
    /// Returns the number of deliveries made; an item nobody is wired
    /// for is dropped.
    pub fn emit(&mut self, item: Item) -> Result<usize, StepError> {
        let mut delivered = self.outputs.deliver(&item);

        for renderer in &self.outputs.renderers {
            if &renderer.data_kind != item.kind() || self.outputs.routes(&renderer.kind).is_empty() {
                continue;
            }
            let rendered = renderer.render(&item)?;
            delivered += self.outputs.deliver(&rendered);
        }

        if delivered == 0 {
            debug!(step_id = %self.step_id, kind = %item.kind(), id = %item.id(), "No destination wired, dropping item");
        }
        Ok(delivered)
    }

    /// Wrap a typed value and emit it
    pub fn emit_data<T: Data>(&mut self, value: T) -> Result<usize, StepError> {
        self.emit(Item::new(value))
    }
}
