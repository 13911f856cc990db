//! A minimal cron-driven task scheduler. Schedules are parsed with the
//! `cron` crate; a background tick loop fires whatever task's next
//! occurrence has passed.

use config::{ScheduledTask, TaskAction, TaskScheduler};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

struct Entry {
    schedule: Schedule,
    raw: String,
    action: TaskAction,
    last_fired: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct CronScheduler {
    tasks: Mutex<HashMap<String, Entry>>,
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the tick loop until `handles.abort()` is called on the returned
    /// handle. Every `tick_interval`, fires `on_fire` for each task whose
    /// next scheduled occurrence since it last fired has passed.
    pub fn spawn_tick_loop(
        self: Arc<Self>,
        tick_interval: Duration,
        on_fire: impl Fn(&TaskAction) + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                self.fire_due(&on_fire);
            }
        })
    }

    fn fire_due(&self, on_fire: &(impl Fn(&TaskAction) + Send + Sync)) {
        let now = chrono::Utc::now();
        let mut tasks = self.tasks.lock();
        for entry in tasks.values_mut() {
            let due = match entry.last_fired {
                Some(last) => entry.schedule.after(&last).next().is_some_and(|next| next <= now),
                None => entry.schedule.upcoming(chrono::Utc).take(1).any(|next| next <= now),
            };
            if due {
                on_fire(&entry.action);
                entry.last_fired = Some(now);
            }
        }
    }
}

impl TaskScheduler for CronScheduler {
    fn add_task(&self, id: String, cron_schedule: String, action: TaskAction) {
        match Schedule::from_str(&cron_schedule) {
            Ok(schedule) => {
                self.tasks.lock().insert(
                    id,
                    Entry {
                        schedule,
                        raw: cron_schedule,
                        action,
                        last_fired: None,
                    },
                );
            }
            Err(error) => {
                tracing::warn!(%error, %cron_schedule, task_id = %id, "invalid cron schedule, task not added");
            }
        }
    }

    fn remove_task(&self, id: &str) -> bool {
        self.tasks.lock().remove(id).is_some()
    }

    fn remove_tasks_with_prefix(&self, prefix: &str) -> usize {
        let mut tasks = self.tasks.lock();
        let doomed: Vec<String> = tasks.keys().filter(|id| id.starts_with(prefix)).cloned().collect();
        for id in &doomed {
            tasks.remove(id);
        }
        doomed.len()
    }

    fn list_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, entry)| ScheduledTask {
                id: id.clone(),
                cron_schedule: entry.raw.clone(),
                action: entry.action.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_tasks_with_prefix_only_removes_matching() {
        let scheduler = CronScheduler::new();
        scheduler.add_task("rule_1".to_string(), "* * * * * *".to_string(), TaskAction::EnableRule("1".to_string()));
        scheduler.add_task("rule_2".to_string(), "* * * * * *".to_string(), TaskAction::DisableRule("2".to_string()));
        scheduler.add_task("ipset_a".to_string(), "* * * * * *".to_string(), TaskAction::RefreshIpSet("a".to_string()));

        let removed = scheduler.remove_tasks_with_prefix("rule_");
        assert_eq!(removed, 2);
        assert_eq!(scheduler.list_tasks().len(), 1);
        assert_eq!(scheduler.list_tasks()[0].id, "ipset_a");
    }

    #[test]
    fn invalid_schedule_is_not_added() {
        let scheduler = CronScheduler::new();
        scheduler.add_task("rule_bad".to_string(), "not a cron expr".to_string(), TaskAction::EnableRule("x".to_string()));
        assert!(scheduler.list_tasks().is_empty());
    }
}
