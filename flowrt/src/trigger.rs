//! Cron-scheduled execution of workspace `trigger` entities.
//!
//! Each tick scans the triggers, and every trigger whose `schedule` matches the current
//! minute starts an independent execution of its `run` target. There is no retry,
//! de-duplication or backpressure.

use crate::engine::ExecuteOptions;
use crate::runtime::Runtime;
use chrono::{DateTime, Local, Timelike};
use croner::Cron;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Whether a cron `schedule` matches the minute containing `now`. Five-field patterns
/// fire at second zero, so the comparison truncates `now` to its minute.
pub fn schedule_matches(schedule: &str, now: &DateTime<Local>) -> RuntimeResult<bool> {
    let cron = Cron::new(schedule)
        .with_seconds_optional()
        .parse()
        .map_err(|e| RuntimeError::TypeError(format!("invalid schedule '{}': {}", schedule, e)))?;
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*now);
    cron.is_time_matching(&minute)
        .map_err(|e| RuntimeError::TypeError(format!("invalid schedule '{}': {}", schedule, e)))
}

pub struct TriggerEngine {
    runtime: Runtime,
    tick: Duration,
}

/// Running trigger loop; `stop` ends it.
pub struct TriggerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "trigger loop ended abnormally");
        }
    }
}

impl TriggerEngine {
    pub fn new(runtime: Runtime) -> Self {
        let tick = runtime.config().trigger_tick();
        Self { runtime, tick }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn start(self) -> TriggerHandle {
        let (shutdown, mut stop) = oneshot::channel();
        let task = tokio::spawn(async move {
            info!(tick_secs = self.tick.as_secs(), "trigger engine started");
            let mut ticker = ticker(self.tick);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        self.fire_due(&Local::now());
                    }
                }
            }
            info!("trigger engine stopped");
        });
        TriggerHandle { shutdown, task }
    }

    /// Start an execution for every trigger due at `now`.
    pub fn fire_due(&self, now: &DateTime<Local>) -> Vec<JoinHandle<()>> {
        let mut started = Vec::new();
        for trigger in self.runtime.workspace().entities_of(EntityKind::Trigger) {
            let schedule = match trigger.property("schedule") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_display_string(),
                None => {
                    warn!(trigger = %trigger.name(), "trigger has no schedule");
                    continue;
                }
            };
            match schedule_matches(&schedule, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(trigger = %trigger.name(), error = %e, "skipping trigger");
                    continue;
                }
            }
            info!(trigger = %trigger.name(), schedule = %schedule, "trigger fired");
            let runtime = self.runtime.clone();
            let trigger = trigger.clone();
            started.push(tokio::spawn(async move {
                if let Err(e) = fire(&runtime, &trigger).await {
                    error!(trigger = %trigger.name(), error = %e, "triggered run failed");
                }
            }));
        }
        started
    }
}

/// Ticks missed during a stall are dropped, so one minute is never evaluated twice.
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn fire(runtime: &Runtime, trigger: &Entity) -> RuntimeResult<()> {
    let target = match trigger.property("run") {
        Some(run) => match runtime.evaluate(run).await? {
            Value::NestedEntity(entity) => *entity,
            other => {
                let name = other.to_display_string();
                runtime
                    .workspace()
                    .pipeline(&name)
                    .or_else(|| runtime.workspace().intent(&name))
                    .cloned()
                    .ok_or_else(|| RuntimeError::not_found("pipeline", name))?
            }
        },
        None => return Err(RuntimeError::missing(trigger.display_name(), "run")),
    };
    let input = match trigger.property("input") {
        Some(input) => Some(runtime.evaluate(input).await?),
        None => None,
    };
    let options = ExecuteOptions {
        input,
        metadata: [("trigger".to_string(), trigger.name().to_string())].into(),
        ..Default::default()
    };
    let result = runtime
        .execute(&target, options)
        .await
        .map_err(|e| e.error)?;
    info!(
        trigger = %trigger.name(),
        execution_id = %result.execution_id,
        "triggered run finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 4, hour, minute, second)
            .single()
            .unwrap()
    }

    #[test]
    fn every_minute_matches_any_second() {
        assert!(schedule_matches("* * * * *", &at(10, 15, 42)).unwrap());
    }

    #[test]
    fn specific_minute_matches_only_that_minute() {
        assert!(schedule_matches("30 9 * * *", &at(9, 30, 5)).unwrap());
        assert!(!schedule_matches("30 9 * * *", &at(9, 31, 0)).unwrap());
    }

    #[test]
    fn invalid_schedules_are_errors() {
        assert!(schedule_matches("every tuesday", &at(1, 0, 0)).is_err());
    }

    #[tokio::test]
    async fn ticker_skips_missed_ticks() {
        let ticker = ticker(Duration::from_secs(60));
        assert_eq!(ticker.missed_tick_behavior(), MissedTickBehavior::Skip);
    }
}
