//! HTTP route handlers

pub mod conversations;
pub mod files;
pub mod health;
pub mod messages;
