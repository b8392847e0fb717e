//! Conversations between an agent and a prospect.

pub mod model;

pub use model::{
    Conversation, ConversationKey, ConversationStatus, Platform, Role, Turn, TurnAppend, TurnLog,
};
