//! Access control for folders, notes and teams, plus the event-driven
//! projection of those facts into a key-value cache.

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod deadletter;
pub mod emitter;
pub mod error;
pub mod events;
pub mod grants;
pub mod identity;
pub mod model;
pub mod permission;
pub mod projector;
pub mod retry;
pub mod service;

pub use error::{AccessError, AccessResult};
pub use events::{DomainEvent, EventRecord, Topic};
pub use model::{Permission, Principal, ResourceRef, Role};
pub use permission::{resolve, resolve_team, Decision, Operation, TeamOperation};
pub use projector::{CacheProjector, ProjectorStats};
pub use service::AccessService;
