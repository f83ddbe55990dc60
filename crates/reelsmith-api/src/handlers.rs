//! Request handlers.

pub mod cron;
pub mod health;
pub mod jobs;
pub mod queues;
pub mod schedules;

pub use cron::*;
pub use health::*;
pub use jobs::*;
pub use queues::*;
pub use schedules::*;
