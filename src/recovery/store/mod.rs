//! Storage backends for recovery data.
//!
//! [`sqlite`] is the durable store used between executions; [`in_mem`]
//! is used internally during resume to query what the durable store
//! contains.

pub(crate) mod in_mem;
pub(crate) mod sqlite;
