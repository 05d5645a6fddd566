//! Status classification for `pg_ctl status`.

use super::control::CommandOutput;
use super::NodeStatus;

/// `pg_ctl status` exits with 3 when no server is running on the data dir.
pub const NOT_RUNNING_EXIT_CODE: i32 = 3;

/// Decides whether a status command result means Running, Stopped, or
/// neither. The human-readable phrase is locale dependent, so the exit
/// code is checked first and the phrases are only a fallback.
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    not_running_markers: Vec<String>,
}

impl StatusClassifier {
    pub fn new(not_running_markers: Vec<String>) -> Self {
        Self {
            not_running_markers,
        }
    }

    /// `None` means the output is not a recognizable status (a probe error).
    pub fn classify(&self, output: &CommandOutput) -> Option<NodeStatus> {
        if output.success {
            return Some(NodeStatus::Running);
        }
        if output.code == Some(NOT_RUNNING_EXIT_CODE) || self.is_not_running_text(&output.text) {
            return Some(NodeStatus::Stopped);
        }
        None
    }

    pub fn is_not_running_text(&self, text: &str) -> bool {
        self.not_running_markers
            .iter()
            .filter(|m| !m.is_empty())
            .any(|m| text.contains(m.as_str()))
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::new(crate::config::ControlConfig::default().not_running_markers)
    }
}
