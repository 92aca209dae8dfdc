pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use dispatcher::Dispatcher;
pub use error::SchedulerError;
pub use scheduler::Scheduler;
