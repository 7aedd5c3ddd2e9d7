//! # Sortie Core - Multi-Stage Scenario Orchestration
//!
//! Rust implementation of the Sortie orchestrator and worker providing:
//! - Plan definitions compiled into stage and step graphs
//! - Run → plan execution → stage execution → step execution state machines
//! - Stage dependencies and conditional step successors
//! - Time-based and event-based stage triggers
//! - Correlation-id RPC over a durable message broker
//! - Workers running each payload in an isolated process
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────────┐
//!   events, replies →│         Orchestrator          │
//!                    │  ┌────────┐   ┌────────────┐  │
//!                    │  │ Engine │──▶│   Store    │  │
//!                    │  └────────┘   └────────────┘  │
//!                    └───────┬───────────────▲───────┘
//!                            │ broker        │
//!                    ┌───────▼──────┐ ┌──────┴───────┐
//!                    │    Worker    │ │  Scheduler   │
//!                    │ tasks, hooks │ │  timed jobs  │
//!                    └──────────────┘ └──────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod broker;
pub mod definition;
pub mod engine;
pub mod orchestrator;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod trigger;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
