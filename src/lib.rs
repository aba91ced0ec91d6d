//! Rholine - real-time voice call mediator
//!
//! Browser clients stream microphone PCM over a WebSocket. Each utterance is
//! transcribed, answered by a language model and spoken back, while the call
//! itself moves through a ringing, answered and conversational lifecycle.

pub mod audio;
pub mod call;
pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod segment;
pub mod server;
pub mod services;
pub mod sounds;
pub mod vad;

#[cfg(test)]
mod testing;
