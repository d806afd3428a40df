//! HTTP request handlers.

mod health;
mod nodes;
mod tasks;
mod webhooks;

pub use health::{health_check, metrics_handler};
pub use nodes::list_nodes;
pub use tasks::{cancel_task, get_task, submit_task};
pub use webhooks::task_status_webhook;
