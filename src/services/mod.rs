//! 服务模块

pub mod agents;
pub mod coordinator;
pub mod dispatcher;
pub mod fallback;
pub mod json_extract;
pub mod memory_store;
pub mod nutrition;
pub mod scoring;

pub use coordinator::{Coordinator, PipelineError, SessionLocks, TurnRequest};
pub use dispatcher::{Dispatcher, is_dangerous, pre_filter};
pub use fallback::FallbackEngine;
pub use memory_store::SessionMemoryStore;
pub use nutrition::{NutritionFact, NutritionProvider, StaticNutritionTable};
