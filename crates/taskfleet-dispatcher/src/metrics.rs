//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;

use taskfleet_core::TaskStatus;

use crate::dispatcher::Dispatcher;

/// Collect all metrics from the dispatcher and format as Prometheus text.
pub async fn collect_metrics(dispatcher: &Dispatcher) -> String {
    let mut output = String::new();

    collect_task_metrics(dispatcher, &mut output).await;
    collect_node_metrics(dispatcher, &mut output).await;

    output
}

/// Collect task metrics by status.
async fn collect_task_metrics(dispatcher: &Dispatcher, output: &mut String) {
    let tasks = dispatcher.state().tasks.read().await;

    let mut pending = 0u64;
    let mut running = 0u64;
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut cancelled = 0u64;

    for task in tasks.values() {
        match task.status {
            TaskStatus::Pending => pending += 1,
            TaskStatus::Running => running += 1,
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
        }
    }
    let active = pending + running;

    writeln!(output, "# HELP taskfleet_tasks_total Total number of tasks by status").ok();
    writeln!(output, "# TYPE taskfleet_tasks_total gauge").ok();
    writeln!(output, "taskfleet_tasks_total{{status=\"pending\"}} {pending}").ok();
    writeln!(output, "taskfleet_tasks_total{{status=\"running\"}} {running}").ok();
    writeln!(output, "taskfleet_tasks_total{{status=\"completed\"}} {completed}").ok();
    writeln!(output, "taskfleet_tasks_total{{status=\"failed\"}} {failed}").ok();
    writeln!(output, "taskfleet_tasks_total{{status=\"cancelled\"}} {cancelled}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP taskfleet_capacity_used Active tasks against fleet capacity").ok();
    writeln!(output, "# TYPE taskfleet_capacity_used gauge").ok();
    writeln!(output, "taskfleet_capacity_used {active}").ok();
    writeln!(output, "taskfleet_capacity_limit {}", dispatcher.config().capacity).ok();
}

/// Collect active task counts per node.
async fn collect_node_metrics(dispatcher: &Dispatcher, output: &mut String) {
    let mut by_node: BTreeMap<String, u64> = dispatcher
        .config()
        .nodes
        .iter()
        .map(|n| (n.name.to_string(), 0))
        .collect();

    for task in dispatcher.state().tasks.read().await.values() {
        if let (true, Some(node)) = (task.status.is_active(), task.node.as_ref()) {
            *by_node.entry(node.to_string()).or_default() += 1;
        }
    }

    writeln!(output).ok();
    writeln!(output, "# HELP taskfleet_node_active_tasks Active tasks by hosting node").ok();
    writeln!(output, "# TYPE taskfleet_node_active_tasks gauge").ok();
    for (node, count) in by_node {
        writeln!(output, "taskfleet_node_active_tasks{{node=\"{node}\"}} {count}").ok();
    }
}
