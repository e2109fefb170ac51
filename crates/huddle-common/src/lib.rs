//! # huddle-common
//!
//! Shared configuration, error handling, and session-token decryption used
//! across all Huddle crates. No signaling logic lives here.

pub mod auth;
pub mod config;
pub mod error;
