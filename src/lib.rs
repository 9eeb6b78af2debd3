//! chatflow conversational flow engine
//!
//! Keyword-triggered conversation flows for chat platforms: flows are
//! compiled into a shared graph, inbound messages are matched against it, and
//! each sender's messages are dispatched in order by a dedicated worker.

pub mod cli;
pub mod config;
pub mod database;
pub mod flows;
pub mod logging;
pub mod provider;
