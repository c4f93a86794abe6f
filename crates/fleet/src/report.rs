//! # Fleet Report
//!
//! Per-node outcomes of one operation, kept in fleet order.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ status: 3/4 succeeded                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ✓ val-1@10.0.0.1  running
//! ✗ val-2@10.0.0.2  connection failed: 10.0.0.2:22 unreachable
//! ```

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::model::NodeSpec;

/// Outcome of one action on one node. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node: String,
    pub host: String,
    pub succeeded: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(node: &NodeSpec, output: String) -> Self {
        Self {
            node: node.name.clone(),
            host: node.host.clone(),
            succeeded: true,
            output,
            error: None,
        }
    }

    pub fn failure(node: &NodeSpec, error: &NodeError) -> Self {
        Self {
            node: node.name.clone(),
            host: node.host.clone(),
            succeeded: false,
            output: String::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn from_outcome(node: &NodeSpec, outcome: Result<String, NodeError>) -> Self {
        match outcome {
            Ok(output) => Self::success(node, output),
            Err(e) => Self::failure(node, &e),
        }
    }

    /// Text shown in the result column.
    pub fn summary(&self) -> &str {
        match &self.error {
            Some(e) => e,
            None => &self.output,
        }
    }
}

/// All results of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetReport {
    pub operation: String,
    pub results: Vec<ExecutionResult>,
}

impl FleetReport {
    pub fn new(operation: impl Into<String>, results: Vec<ExecutionResult>) -> Self {
        Self {
            operation: operation.into(),
            results,
        }
    }

    pub fn get(&self, node: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.node == node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded)
    }

    pub fn failed(&self) -> Vec<&ExecutionResult> {
        self.results.iter().filter(|r| !r.succeeded).collect()
    }

    /// One `name@host <result>` line per node under a summary box.
    /// Further lines of a multi-line result follow indented.
    pub fn to_table(&self) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.node.len() + r.host.len() + 1)
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        out.push_str("┌──────────────────────────────────────────────────────────────┐\n");
        let title = format!(
            "{}: {}/{} succeeded",
            self.operation,
            self.succeeded_count(),
            self.len()
        );
        out.push_str(&format!("│ {:60} │\n", truncate_str(&title, 60)));
        out.push_str("└──────────────────────────────────────────────────────────────┘\n");

        for r in &self.results {
            let symbol = if r.succeeded { "✓" } else { "✗" };
            let label = format!("{}@{}", r.node, r.host);
            let mut lines = r.summary().lines();
            let first = lines.next().unwrap_or("");
            out.push_str(&format!("{} {:width$}  {}\n", symbol, label, first, width = width));
            for line in lines {
                out.push_str(&format!("    {}\n", line));
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
