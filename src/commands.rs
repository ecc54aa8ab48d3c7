use crate::connection::ConnectionHandle;
use crate::models::{StartJobAction, StopJobAction};
use crate::topics::{Topic, UnsTopics};
use tracing::info;

/// Operator command sent to the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartJob(StartJobAction),
    StopJob(StopJobAction),
}

impl Command {
    pub fn topic<'a>(&self, topics: &'a UnsTopics) -> &'a Topic {
        match self {
            Command::StartJob(_) => &topics.start_job,
            Command::StopJob(_) => &topics.stop_job,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::StartJob(_) => "start_job",
            Command::StopJob(_) => "stop_job",
        }
    }
}

/// Publishes job commands on the line's Action topics.
pub struct CommandPublisher {
    handle: ConnectionHandle,
    topics: UnsTopics,
}

impl CommandPublisher {
    pub fn new(handle: ConnectionHandle, topics: UnsTopics) -> Self {
        Self { handle, topics }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn topics(&self) -> &UnsTopics {
        &self.topics
    }

    /// Fire-and-forget; a disconnected client drops the command with a warning.
    pub async fn send(&self, command: &Command) {
        let topic = command.topic(&self.topics).as_str();
        info!("Sending {} command on {}", command.name(), topic);
        match command {
            Command::StartJob(action) => self.handle.publish_json(topic, action).await,
            Command::StopJob(action) => self.handle.publish_json(topic, action).await,
        }
    }

    pub async fn start_job(&self, action: StartJobAction) {
        self.send(&Command::StartJob(action)).await;
    }

    pub async fn stop_job(&self, action: StopJobAction) {
        self.send(&Command::StopJob(action)).await;
    }

    pub async fn detach(self) {
        self.handle.detach().await;
    }
}
