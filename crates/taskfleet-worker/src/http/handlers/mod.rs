//! HTTP request handlers.

mod admin;
mod health;
mod tasks;

pub use admin::refresh_token;
pub use health::health_check;
pub use tasks::{cancel_task, dispatch_task, get_task};
