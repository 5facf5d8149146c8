//! Parley core library: session lifecycle tracking, the inbound message pipeline, channels,
//! LLM backends, message storage and the status gateway, used by the CLI.

pub mod channels;
pub mod config;
pub mod filter;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod orchestrator;
pub mod responder;
pub mod service;
pub mod session;
pub mod store;
