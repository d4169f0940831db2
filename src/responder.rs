use bitflags::bitflags;
use tracing::trace;

bitflags! {
    /// Capabilities a chain element can declare.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
    pub struct Capabilities: u8 {
        /// Connection management against the radio.
        const CENTRAL = 0b0000_0001;
        /// Attribute reads, writes, subscriptions and discovery on a live link.
        const GATT_IO = 0b0000_0010;
        /// Opening L2CAP channels on a live link.
        const L2CAP = 0b0000_0100;
    }
}

/// A request routed along a responder chain.
pub trait Message {
    /// Value produced by the handling responder.
    type Output;

    /// Capability the handling responder must declare.
    fn required(&self) -> Capabilities;

    /// Short name used in logs and `Unhandled` errors.
    fn name(&self) -> &'static str;
}

/// Result of walking a responder chain.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Dispatch<O, M> {
    /// A responder accepted the message and produced an output.
    Handled(O),
    /// The chain was exhausted; the message is handed back untouched.
    Unhandled(M),
}

impl<O, M> Dispatch<O, M> {
    /// Returns whether a responder handled the message.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }

    /// Converts to an `Option`, discarding an unhandled message.
    pub fn handled(self) -> Option<O> {
        match self {
            Self::Handled(output) => Some(output),
            Self::Unhandled(_) => None,
        }
    }
}

/// A linked sequence of responders addressed by `Copy` links.
pub trait ResponderChain<M: Message> {
    /// Address of one chain element.
    type Link: Copy + std::fmt::Debug;

    /// Returns the element after `link`, or `None` at the root.
    fn next_responder(&self, link: Self::Link) -> Option<Self::Link>;

    /// Returns the capabilities `link` currently declares.
    fn capabilities(&self, link: Self::Link) -> Capabilities;

    /// Executes `message` at `link`. Only called when `link` declares the
    /// message's required capability.
    fn respond(&mut self, link: Self::Link, message: M) -> M::Output;
}

/// Returns the first link from `start` able to handle `message`.
pub fn responder_for<C, M>(chain: &C, message: &M, start: C::Link) -> Option<C::Link>
where
    C: ResponderChain<M>,
    M: Message,
{
    let required = message.required();
    let mut cursor = Some(start);
    while let Some(link) = cursor {
        if chain.capabilities(link).contains(required) {
            return Some(link);
        }
        cursor = chain.next_responder(link);
    }
    None
}

/// Returns whether some link from `start` onwards can handle `message`.
pub fn can_dispatch<C, M>(chain: &C, message: &M, start: C::Link) -> bool
where
    C: ResponderChain<M>,
    M: Message,
{
    responder_for(chain, message, start).is_some()
}

/// Walks the chain from `start` and executes `message` at the first capable link.
pub fn try_dispatch<C, M>(chain: &mut C, message: M, start: C::Link) -> Dispatch<M::Output, M>
where
    C: ResponderChain<M>,
    M: Message,
{
    match responder_for(chain, &message, start) {
        Some(link) => {
            trace!(message = message.name(), ?link, "dispatching message");
            Dispatch::Handled(chain.respond(link, message))
        }
        None => {
            trace!(message = message.name(), ?start, "message unhandled");
            Dispatch::Unhandled(message)
        }
    }
}
