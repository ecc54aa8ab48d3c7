use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// Telemetry comes from line equipment we do not control. Numeric fields that
// are missing, null or of the wrong JSON type read as zero (or absent) rather
// than rejecting the whole message.

fn number_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Value::as_f64).unwrap_or_default())
}

fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
}

fn optional_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(integer))
}

fn integer_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    optional_integer(deserializer).map(Option::unwrap_or_default)
}

fn counter_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(integer)
        .map(|v| u64::try_from(v).unwrap_or_default())
        .unwrap_or_default())
}

/// Strings pass through, numbers and booleans are rendered, anything else is absent.
fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(other @ (Value::Number(_) | Value::Bool(_))) => Some(other.to_string()),
        _ => None,
    })
}

/// Parses the nested value as `T`, treating anything unparseable as absent.
fn optional_lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// `State/current_job` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJob {
    #[serde(default, deserialize_with = "integer_or_default")]
    pub job_id: i64,
    #[serde(default, deserialize_with = "optional_integer", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    #[serde(default, deserialize_with = "optional_integer", skip_serializing_if = "Option::is_none")]
    pub planned_quantity: Option<i64>,
    #[serde(default, deserialize_with = "optional_integer", skip_serializing_if = "Option::is_none")]
    pub completed_quantity: Option<i64>,
    #[serde(default, deserialize_with = "optional_integer", skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    Info,
    Warning,
    Error,
}

/// `State/alarm_status` payload. An empty object means no alarm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmStatus {
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, deserialize_with = "optional_lenient", skip_serializing_if = "Option::is_none")]
    pub level: Option<AlarmLevel>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AlarmStatus {
    pub fn is_active(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.code) || present(&self.msg)
    }
}

/// Good/bad board counters. Missing counters read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardsCount {
    #[serde(default, deserialize_with = "counter_or_default")]
    pub good: u64,
    #[serde(default, deserialize_with = "counter_or_default")]
    pub bad: u64,
    #[serde(default, deserialize_with = "counter_or_default")]
    pub total: u64,
}

/// `Metric/board_cycle_time` payload. A `boards_count` that is not an
/// object is ignored; the cycle-time sample is still taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardCycleTime {
    #[serde(default, deserialize_with = "number_or_default")]
    pub cycle_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
    #[serde(default, deserialize_with = "optional_lenient", skip_serializing_if = "Option::is_none")]
    pub boards_count: Option<BoardsCount>,
}

/// `Action/start_job` command body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobAction {
    pub job_id: i64,
    pub product_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_quantity: Option<i64>,
}

/// `Action/stop_job` command body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopJobAction {
    pub job_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_job_keeps_unknown_fields() {
        let job: CurrentJob =
            serde_json::from_str(r#"{"job_id":7,"status":2,"operator":"kim"}"#).unwrap();

        assert_eq!(job.job_id, 7);
        assert_eq!(job.status, Some(2));
        assert_eq!(job.product_id, None);
        assert_eq!(job.extra.get("operator"), Some(&Value::from("kim")));
    }

    #[test]
    fn current_job_without_status_is_accepted() {
        let job: CurrentJob = serde_json::from_str(r#"{"job_id":5,"product_id":7}"#).unwrap();

        assert_eq!(job.job_id, 5);
        assert_eq!(job.product_id, Some(7));
        assert_eq!(job.status, None);
    }

    #[test]
    fn current_job_tolerates_odd_numeric_types() {
        let job: CurrentJob =
            serde_json::from_str(r#"{"job_id":"J-5","status":2.0,"planned_quantity":null}"#)
                .unwrap();

        assert_eq!(job.job_id, 0);
        assert_eq!(job.status, Some(2));
        assert_eq!(job.planned_quantity, None);
    }

    #[test]
    fn null_cycle_time_reads_as_zero() {
        let cycle: BoardCycleTime = serde_json::from_str(r#"{"cycle_time_ms": null}"#).unwrap();
        assert_eq!(cycle.cycle_time_ms, 0.0);

        let cycle: BoardCycleTime = serde_json::from_str(r#"{"cycle_time_ms": "fast"}"#).unwrap();
        assert_eq!(cycle.cycle_time_ms, 0.0);
    }

    #[test]
    fn board_counters_accept_floats_and_nulls() {
        let cycle: BoardCycleTime = serde_json::from_str(
            r#"{"cycle_time_ms":1234,"boards_count":{"good":9.0,"bad":1,"total":null}}"#,
        )
        .unwrap();

        assert_eq!(cycle.cycle_time_ms, 1234.0);
        assert_eq!(cycle.boards_count, Some(BoardsCount { good: 9, bad: 1, total: 0 }));
    }

    #[test]
    fn unusable_board_count_keeps_cycle_time() {
        let cycle: BoardCycleTime =
            serde_json::from_str(r#"{"cycle_time_ms":1234,"boards_count":"n/a"}"#).unwrap();

        assert_eq!(cycle.cycle_time_ms, 1234.0);
        assert_eq!(cycle.boards_count, None);
    }

    #[test]
    fn alarm_with_empty_fields_is_inactive() {
        let cleared: AlarmStatus = serde_json::from_str(r#"{"code":"","msg":""}"#).unwrap();
        let raised: AlarmStatus =
            serde_json::from_str(r#"{"code":"E42","level":"error"}"#).unwrap();

        assert!(!cleared.is_active());
        assert!(raised.is_active());
        assert_eq!(raised.level, Some(AlarmLevel::Error));
    }

    #[test]
    fn numeric_alarm_code_counts_as_active() {
        let alarm: AlarmStatus =
            serde_json::from_str(r#"{"code":42,"level":"critical"}"#).unwrap();

        assert_eq!(alarm.code.as_deref(), Some("42"));
        assert_eq!(alarm.level, None);
        assert!(alarm.is_active());
    }

    #[test]
    fn stop_job_without_reason_omits_field() {
        let body = serde_json::to_string(&StopJobAction { job_id: 3, reason: None }).unwrap();
        assert_eq!(body, r#"{"job_id":3}"#);
    }
}
