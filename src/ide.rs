//! IDE-side adapters: the read-only conversation store and the
//! keystroke-injection actuator.

pub mod actuator;
pub mod store;

pub use actuator::{ConversationDelivery, InputActuator, MessageInjector};
pub use store::{ComposerStore, ConversationSource, RankedConversation};
