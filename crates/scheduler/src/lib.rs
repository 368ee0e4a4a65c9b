pub mod entry;
pub mod scheduler;

pub use entry::{
    callback_fn, EntryInfo, SchedulerStats, TaskCallback, TaskPredicate, TriggerConfig,
    TriggerKind,
};
pub use scheduler::{UnifiedScheduler, TICK_SECONDS};
