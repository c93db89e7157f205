#![forbid(unsafe_code)]

pub mod action_handler;
pub mod action_messages;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod dispatcher_registry;
pub mod error;
pub mod health;
pub mod registry;
pub mod session_service;
pub mod sql_store;
pub mod store;

#[cfg(test)]
mod test_support;
