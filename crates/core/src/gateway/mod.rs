//! Action gateway: the only path from oracle output to executable actions.

pub mod action;
pub mod debug;
pub mod plan;
pub mod resolver;

pub use action::{validate, validate_all, Action, ActionRecord};
pub use debug::{DebugEntry, DebugLog};
pub use plan::{group_writes, normalize_plan, Plan, PlannedWrite, Task, TaskStatus};
pub use resolver::{ActionGateway, AgentTurn, ClientState, TurnRequest};
