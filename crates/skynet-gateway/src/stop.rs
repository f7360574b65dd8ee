//! `/stop` emergency stop — interrupts every chat's in-flight sandbox run
//! and cancels all scheduled tasks.

use tracing::info;

use crate::app::AppState;

/// Execute the emergency stop sequence and return a human-readable report.
///
/// Steps:
/// 1. Interrupt every chat currently draining (aborts its sandbox run, C5/C7).
/// 2. Cancel every scheduled task.
pub async fn execute_stop(app: &AppState) -> String {
    let mut lines: Vec<String> = Vec::new();

    let draining = app.drains.chats_draining();
    for chat_id in &draining {
        app.drains.interrupt(chat_id);
    }
    if draining.is_empty() {
        lines.push("- No active pipelines".to_string());
    } else {
        for chat_id in &draining {
            lines.push(format!("- Pipeline interrupted: `{}`", chat_id));
        }
    }

    let mut tasks_removed = 0usize;
    if let Ok(tasks) = app.scheduler.list_tasks() {
        for task in &tasks {
            if app.scheduler.cancel_task(&task.id).is_ok() {
                tasks_removed += 1;
            }
        }
    }
    if tasks_removed > 0 {
        lines.push(format!("- {} scheduled task(s) cancelled", tasks_removed));
    } else {
        lines.push("- No scheduled tasks".to_string());
    }

    let report = format!("**Emergency stop executed:**\n{}", lines.join("\n"));
    info!(
        "/stop executed: interrupted={} tasks={}",
        draining.len(),
        tasks_removed
    );
    report
}
