//! Agent execution engine (component I): role-specific prompt/schema data, JSON extraction and
//! iterative repair, and the runtime that drives one role through route -> call -> repair ->
//! record.

pub mod json_repair;
pub mod role;
pub mod runtime;

pub use json_repair::{apply_patch, extract_json, repair_loop, validate, PatchOp, RepairOutcome, MAX_REPAIR_ATTEMPTS};
pub use role::{AgentRole, CustomAgentSpec, FieldType, Schema, SchemaField};
pub use runtime::{AgentCallOutcome, AgentRuntime, DEFAULT_CALL_TIMEOUT};
