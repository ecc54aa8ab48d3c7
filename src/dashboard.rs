use crate::models::{AlarmStatus, BoardCycleTime, BoardsCount, CurrentJob};
use crate::registry::{HandlerError, MessageHandler};
use crate::topics::UnsTopics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tracing::debug;

/// Number of cycle-time samples kept for the trend.
pub const CYCLE_TIME_HISTORY_LIMIT: usize = 50;

pub type SharedDashboard = Arc<Mutex<DashboardState>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleTimePoint {
    pub time: String,
    pub cycle_time: f64,
}

/// Live view of the line, rebuilt from State/Metric messages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardState {
    pub current_job: Option<CurrentJob>,
    pub alarm_status: Option<AlarmStatus>,
    pub cycle_time_ms: f64,
    pub cycle_time_history: VecDeque<CycleTimePoint>,
    pub boards_count: BoardsCount,
}

fn parse<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T, HandlerError> {
    let text = std::str::from_utf8(payload).map_err(|_| HandlerError::InvalidUtf8 {
        topic: topic.to_string(),
    })?;
    serde_json::from_str(text).map_err(|source| HandlerError::MalformedPayload {
        topic: topic.to_string(),
        source,
    })
}

fn clock_label(now: OffsetDateTime) -> String {
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}

impl DashboardState {
    pub fn has_alarm(&self) -> bool {
        self.alarm_status.as_ref().is_some_and(AlarmStatus::is_active)
    }

    /// Applies one message. Returns `Ok(false)` for topics the dashboard
    /// does not show; a malformed payload leaves the state untouched.
    pub fn apply(&mut self, topics: &UnsTopics, topic: &str, payload: &[u8]) -> Result<bool, HandlerError> {
        if topics.current_job == topic {
            let job: CurrentJob = parse(topic, payload)?;
            debug!("Processing current job {}", job.job_id);
            self.current_job = Some(job);
        } else if topics.alarm_status == topic {
            self.alarm_status = Some(parse(topic, payload)?);
        } else if topics.board_cycle_time == topic {
            let cycle: BoardCycleTime = parse(topic, payload)?;
            self.record_cycle_time(cycle, OffsetDateTime::now_utc());
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn record_cycle_time(&mut self, cycle: BoardCycleTime, now: OffsetDateTime) {
        self.cycle_time_ms = cycle.cycle_time_ms;
        self.cycle_time_history.push_back(CycleTimePoint {
            time: clock_label(now),
            cycle_time: cycle.cycle_time_ms,
        });
        while self.cycle_time_history.len() > CYCLE_TIME_HISTORY_LIMIT {
            self.cycle_time_history.pop_front();
        }
        if let Some(count) = cycle.boards_count {
            self.boards_count = count;
        }
    }
}

/// Handler feeding a shared dashboard from the connection's messages.
pub fn dashboard_handler(topics: UnsTopics, state: SharedDashboard) -> Arc<dyn MessageHandler> {
    Arc::new(move |topic: &str, payload: &[u8]| -> Result<(), HandlerError> {
        let mut dashboard = state.lock().unwrap_or_else(PoisonError::into_inner);
        dashboard.apply(&topics, topic, payload).map(|_| ())
    })
}
