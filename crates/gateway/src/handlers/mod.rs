//! API handlers module

pub mod health;
pub mod messages;
pub mod sessions;
