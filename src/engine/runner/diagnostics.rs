use std::collections::HashSet;
use std::fmt::Write;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::NodeId;
use crate::engine::TaskKind;

/// One executed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Index of the task in its session graph.
    pub index: usize,
    pub kind: TaskKind,
    pub label: String,
    pub node: Option<NodeId>,
    pub source: Option<usize>,
    #[serde(skip)]
    pub start: Instant,
    pub duration: Duration,
    /// Whether the task ran on the designated thread.
    pub designated: bool,
    /// Whether the task was a no-op because its session was cancelled.
    pub skipped: bool,
    /// Indices of the tasks it waited for.
    pub prerequisites: Vec<usize>,
}

impl TaskRecord {
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

/// Execution report of one session, tasks in the order they completed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Timeline {
    records: Vec<TaskRecord>,
}

impl Timeline {
    pub(crate) fn new(records: Vec<TaskRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The first task of a kind, optionally about a given node.
    pub fn find(&self, kind: TaskKind, node: Option<&str>) -> Option<&TaskRecord> {
        self.records.iter().find(|record| {
            record.kind == kind
                && node.is_none_or(|node| record.node.as_ref().is_some_and(|n| n.as_str() == node))
        })
    }

    /// Every task of a kind.
    pub fn of_kind(&self, kind: TaskKind) -> impl Iterator<Item = &TaskRecord> {
        self.records.iter().filter(move |record| record.kind == kind)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the executed tasks as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Skipped (cancelled session)
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for record in self.records.iter().filter(|r| !r.skipped) {
            let secs = record.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // Nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut present = HashSet::new();
        for record in &self.records {
            present.insert(record.index);

            let name = record.label.replace('"', "\\\"");
            let (label_extra, color_code) = if record.skipped {
                ("Skipped".to_string(), "#D3D3D3".to_string())
            } else {
                let t = (record.duration.as_secs_f64() - min_time) / (max_time - min_time);

                // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                let (r, g, b) = if t < 0.5 {
                    ((255.0 * t * 2.0) as u8, 255, 0)
                } else {
                    (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
                };

                let place = if record.designated { "designated" } else { "worker" };
                (
                    format!("{:.2?} on {place}", record.duration),
                    format!("#{r:02X}{g:02X}{b:02X}"),
                )
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", record.index, name, label_extra)?;
            writeln!(f, "    style {} fill:{}", record.index, color_code)?;
        }

        for record in &self.records {
            for prerequisite in &record.prerequisites {
                if present.contains(prerequisite) {
                    writeln!(f, "    {} --> {}", prerequisite, record.index)?;
                }
            }
        }

        Ok(())
    }
}
