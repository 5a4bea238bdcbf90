//! The failover controller: registry, group monitoring, hooks, lifecycle
//! and the HTTP control surface.

pub mod app;
pub mod group;
pub mod hooks;
pub mod http;
pub mod middleware;
pub mod registry;

pub use app::Orchestrator;
pub use group::{Group, GroupStatus};
pub use hooks::{AfterFailoverHook, BeforeFailoverHook, Hooks};
pub use registry::{Action, Command, MasterRegistry};
