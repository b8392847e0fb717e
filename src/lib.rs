//! Setter AI: lead-qualification conversation pipeline.

pub mod admin;
pub mod agent_config;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod qualification;
pub mod queue;
pub mod store;
pub mod webhook;
pub mod worker;
