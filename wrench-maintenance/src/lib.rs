pub mod intervals;
pub mod scheduler;

pub use intervals::IntervalTable;
pub use scheduler::{MaintenanceScheduler, Priority, Reminder, ReminderKind};
