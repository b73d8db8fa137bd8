//! Shared vocabulary for the maestro orchestration engine: ids, statuses,
//! the message model, the model-backend and capability contracts, and the
//! client/server event sum types.

pub mod backend;
pub mod capability;
pub mod events;
pub mod ids;
pub mod messages;
pub mod schedule;
pub mod session;
pub mod status;
pub mod tokens;
