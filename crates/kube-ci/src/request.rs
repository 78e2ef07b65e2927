//! Execution requests, identifiers and results.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Work to run: a container image and the shell commands to run inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Container image reference (e.g. `golang:1.22`)
    pub image: String,
    /// Commands run in order by a single shell
    #[serde(default)]
    pub commands: Vec<String>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new<I, S>(image: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: image.into(),
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// The commands joined into the script handed to `sh -c`.
    ///
    /// Newline separation keeps the commands sequential without making a
    /// failing command abort the rest.
    #[must_use]
    pub fn script(&self) -> String {
        self.commands.join("\n")
    }

    /// True when there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Caller-chosen name of one execution.
///
/// Must be unique among executions that are live at the same time. The raw
/// value is kept; it is sanitized into a resource name when the unit spec is
/// built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier from the current time, e.g.
    /// `ci-20240131-150405-123456789`.
    #[must_use]
    pub fn timestamped(prefix: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S-%f");
        if prefix.is_empty() {
            Self(stamp.to_string())
        } else {
            Self(format!("{}-{stamp}", prefix.to_lowercase()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How the container finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Succeeded,
    /// The script exited non-zero (or the pod was killed)
    Failed {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
}

/// Output of a finished execution, handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Combined stdout/stderr of the container, verbatim
    pub output: String,
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// Result for a request with no commands.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            output: String::new(),
            outcome: Outcome::Succeeded,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::is_valid_resource_name;

    #[test]
    fn script_joins_commands_with_newlines() {
        let request = ExecutionRequest::new("golang", ["cd /src", "go test ./...", "echo done"]);
        assert_eq!(request.script(), "cd /src\ngo test ./...\necho done");
        assert!(!request.is_empty());
        assert!(ExecutionRequest::new("golang", Vec::<String>::new()).is_empty());
    }

    #[test]
    fn timestamped_ids_are_valid_resource_names() {
        let id = ExecutionId::timestamped("CI");
        assert!(id.as_str().starts_with("ci-"));
        assert!(is_valid_resource_name(id.as_str()), "{id}");

        let bare = ExecutionId::timestamped("");
        assert!(is_valid_resource_name(bare.as_str()), "{bare}");
    }

    #[test]
    fn result_serializes_with_outcome_tag() {
        let result = ExecutionResult {
            output: "FAIL\n".to_string(),
            outcome: Outcome::Failed { exit_code: Some(1) },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["exitCode"], 1);
        assert!(!result.is_success());
        assert!(ExecutionResult::empty().is_success());
    }

    #[test]
    fn request_deserializes_without_commands() {
        let request: ExecutionRequest = serde_json::from_str(r#"{"image":"golang"}"#).unwrap();
        assert!(request.is_empty());
    }
}
