//! ARC - a local voice and text assistant
//!
//! This library provides the core of the ARC agent:
//! - Agent orchestration (reasoning loop, tool dispatch, step bound)
//! - Tool registry with native tools and context protocol (MCP) servers
//! - Encrypted long-term memory in SQLite
//! - Speech I/O loop with barge-in
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                        │
//! │        Text REPL        │        Voice session       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ process_turn(text) -> text
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Orchestrator                        │
//! │   Reasoning engine  │  Tool registry  │  Memory      │
//! └──────────┬──────────────────┬───────────────┬───────┘
//!            │                  │               │
//!   OpenAI-compatible     Native tools /   Encrypted
//!     chat provider        MCP servers      SQLite
//! ```

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod tools;
pub mod voice;

pub use agent::{Orchestrator, TurnOutcome, TurnReport};
pub use config::Config;
pub use db::{DbConn, DbPool, MemoryFact, MemoryStore};
pub use error::{Error, Result, ToolFailure};
pub use tools::{ToolDescriptor, ToolKind, ToolRegistry};
