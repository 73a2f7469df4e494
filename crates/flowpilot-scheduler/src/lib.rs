// FlowPilot scheduler: cron/interval timer jobs with persistence, file
// watching with per-path debouncing, webhook registry, and the schedule
// manager reconciling them with the store.

pub mod jobs;
pub mod manager;
pub mod service;
pub mod triggers;
pub mod watcher;
pub mod webhooks;

pub use jobs::JobStore;
pub use manager::{ScheduleManager, ScheduleManagerError, ScheduleStatus};
pub use service::{ScheduleInfo, SchedulerService};
pub use triggers::{TriggerParseError, TriggerSchedule};
pub use watcher::{FileWatchService, WatchInfo};
pub use webhooks::{WebhookAuthError, WebhookInfo, WebhookRegistry};
