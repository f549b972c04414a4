use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Started,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "QUEUED" => Some(Self::Queued),
            "STARTED" => Some(Self::Started),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Forward-only transitions. QUEUED -> FAILURE covers a job that never
    /// reached a worker.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Started)
                | (TaskStatus::Queued, TaskStatus::Failure)
                | (TaskStatus::Started, TaskStatus::Success)
                | (TaskStatus::Started, TaskStatus::Failure)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            TaskStatus::Queued,
            TaskStatus::Started,
            TaskStatus::Success,
            TaskStatus::Failure,
        ] {
            assert!(!TaskStatus::Success.can_transition_to(next));
            assert!(!TaskStatus::Failure.can_transition_to(next));
        }
    }

    #[test]
    fn queued_can_fail_without_starting() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Failure));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Started));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Started.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn parses_stored_values() {
        assert_eq!(TaskStatus::parse("started"), Some(TaskStatus::Started));
        assert_eq!(TaskStatus::parse("FAILURE"), Some(TaskStatus::Failure));
        assert_eq!(TaskStatus::parse("running"), None);
        assert_eq!(
            serde_json::to_value(TaskStatus::Queued).unwrap(),
            serde_json::json!("QUEUED")
        );
    }
}
