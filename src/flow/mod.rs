// SPDX-License-Identifier: MIT

//! Workflow engine
//!
//! - [store] - property-graph store contract and in-memory backend
//! - [workflow] - workflow handles and the workflow manager
//! - [scheduler] - graph traversal for a run
//! - [agent] - executes one agent
//! - [pipe] - outbound events and inbound feedback of a run
//! - [run_context] - per-run outcome bookkeeping
//! - [output] - persisted step outputs
//! - [tools] / [mcp] - tool catalogue and the MCP transport
//! - [loader] / [config] - YAML workflow files and engine settings

pub mod agent;
pub mod config;
pub mod loader;
pub mod mcp;
pub mod output;
pub mod pipe;
pub mod run_context;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod workflow;
