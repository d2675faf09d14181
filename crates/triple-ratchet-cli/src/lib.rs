//! Triple Ratchet CLI
//!
//! `demo` runs two sessions in-process over a lossy link; `chat` is a
//! line-oriented REPL that exchanges hex-encoded messages with a peer
//! running the same command in another terminal.

pub mod chat;
pub mod demo;
pub mod tracing_init;
