//! Unified namespace topic naming.
//!
//! Every topic on the line follows
//! `v1/<enterprise>/<site>/<area>/<line>/<device>/<namespace>/<leaf>`.
//! Segment order and casing are a wire contract with the line devices.

use serde::{Deserialize, Serialize};
use std::fmt;

const TOPIC_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    State,
    Action,
    Metric,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::State => "State",
            Namespace::Action => "Action",
            Namespace::Metric => "Metric",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plant hierarchy the dashboard is bound to. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub enterprise: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub device: String,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self {
            enterprise: "Plant_Name".to_string(),
            site: "SMT-Area-1".to_string(),
            area: "SMT-Line-1".to_string(),
            line: "Printer-Cell".to_string(),
            device: "Printer01".to_string(),
        }
    }
}

/// Fully qualified topic string. Compared by exact equality, no wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Topic {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Builds the topic for `leaf` under `namespace`. Empty segments are kept as
/// empty path components.
pub fn build_topic(hierarchy: &Hierarchy, namespace: Namespace, leaf: &str) -> Topic {
    Topic(format!(
        "{}/{}/{}/{}/{}/{}/{}/{}",
        TOPIC_VERSION,
        hierarchy.enterprise,
        hierarchy.site,
        hierarchy.area,
        hierarchy.line,
        hierarchy.device,
        namespace,
        leaf
    ))
}

/// Topics the dashboard and the job entry commands use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsTopics {
    pub current_job: Topic,
    pub alarm_status: Topic,
    pub board_cycle_time: Topic,
    pub start_job: Topic,
    pub stop_job: Topic,
}

impl UnsTopics {
    pub fn new(hierarchy: &Hierarchy) -> Self {
        Self {
            current_job: build_topic(hierarchy, Namespace::State, "current_job"),
            alarm_status: build_topic(hierarchy, Namespace::State, "alarm_status"),
            board_cycle_time: build_topic(hierarchy, Namespace::Metric, "board_cycle_time"),
            start_job: build_topic(hierarchy, Namespace::Action, "start_job"),
            stop_job: build_topic(hierarchy, Namespace::Action, "stop_job"),
        }
    }

    /// The State/Metric topics the live dashboard listens on.
    pub fn telemetry(&self) -> Vec<Topic> {
        vec![
            self.current_job.clone(),
            self.alarm_status.clone(),
            self.board_cycle_time.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_state_topic_for_default_plant() {
        let hierarchy = Hierarchy {
            enterprise: "Plant_Name".into(),
            site: "SMT-Area-1".into(),
            area: "SMT-Line-1".into(),
            line: "Printer-Cell".into(),
            device: "Printer01".into(),
        };

        let topic = build_topic(&hierarchy, Namespace::State, "current_job");

        assert_eq!(
            topic.as_str(),
            "v1/Plant_Name/SMT-Area-1/SMT-Line-1/Printer-Cell/Printer01/State/current_job"
        );
    }

    #[test]
    fn empty_segments_render_as_empty_components() {
        let hierarchy = Hierarchy {
            enterprise: "Acme".into(),
            site: String::new(),
            area: "A".into(),
            line: String::new(),
            device: "D".into(),
        };

        let topic = build_topic(&hierarchy, Namespace::Metric, "oee");

        assert_eq!(topic, "v1/Acme//A//D/Metric/oee");
    }

    #[test]
    fn predefined_topics_use_expected_namespaces() {
        let topics = UnsTopics::new(&Hierarchy::default());
        let prefix = "v1/Plant_Name/SMT-Area-1/SMT-Line-1/Printer-Cell/Printer01";

        assert_eq!(topics.alarm_status.to_string(), format!("{prefix}/State/alarm_status"));
        assert_eq!(
            topics.board_cycle_time.to_string(),
            format!("{prefix}/Metric/board_cycle_time")
        );
        assert_eq!(topics.start_job.to_string(), format!("{prefix}/Action/start_job"));
        assert_eq!(topics.stop_job.to_string(), format!("{prefix}/Action/stop_job"));
        assert_eq!(topics.telemetry().len(), 3);
    }
}
