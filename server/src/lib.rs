//! Parley chat server
//!
//! A multi-user TCP chat service: line-based request/response protocol,
//! password accounts, friendships, groups, and private/group messaging with
//! live push delivery to recipients who are viewing the conversation.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod logger;
pub mod sessions;
pub mod state;
pub mod store;
