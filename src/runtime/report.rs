//! Block and task reports
//!
//! A read-only snapshot of what every domain is doing, taken from outside
//! the workers. Collection never blocks: locks are only tried for a bounded
//! time and a domain whose state could not be read is marked incomplete.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::runtime::domain::{DomainId, ExecutionDomain};
use crate::runtime::scheduler::{BlockedOn, TaskId, TaskState};

/// How long a snapshot waits for a domain's task table.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(10);

/// A suspended task and what it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedTask {
    pub task: TaskId,
    pub name: String,
    pub blocked_on: BlockedOn,
}

/// One live task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task: TaskId,
    pub name: String,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_on: Option<BlockedOn>,
}

/// Snapshot of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainReport {
    pub domain: DomainId,
    /// False when some state could not be read without blocking.
    pub complete: bool,
    pub live_tasks: usize,
    pub pending_ops: usize,
    /// Present when block reports are enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<Vec<BlockedTask>>,
    /// Present when task reports are enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskSummary>>,
}

impl DomainReport {
    /// Snapshot `domain`.
    pub fn collect(
        domain: &ExecutionDomain,
        block_report: bool,
        task_report: bool,
    ) -> Self {
        let mut report = DomainReport {
            domain: domain.id(),
            complete: true,
            live_tasks: 0,
            pending_ops: domain.endpoint().pending_ops(),
            blocked: None,
            tasks: None,
        };

        let Some(live) = domain.pool().try_snapshot(SNAPSHOT_TIMEOUT) else {
            report.complete = false;
            return report;
        };
        report.live_tasks = live.len();

        let mut blocked = Vec::new();
        let mut tasks = Vec::new();
        for task in &live {
            let blocked_on = match task.try_blocked_on() {
                Some(reason) => reason,
                None => {
                    report.complete = false;
                    None
                },
            };
            let state = task.state();
            if block_report && state == TaskState::Suspended {
                if let Some(reason) = &blocked_on {
                    blocked.push(BlockedTask {
                        task: task.id(),
                        name: task.name().to_string(),
                        blocked_on: reason.clone(),
                    });
                }
            }
            if task_report {
                tasks.push(TaskSummary {
                    task: task.id(),
                    name: task.name().to_string(),
                    parent: task.parent(),
                    state,
                    blocked_on,
                });
            }
        }

        if block_report {
            report.blocked = Some(blocked);
        }
        if task_report {
            report.tasks = Some(tasks);
        }
        report
    }

    fn fmt_tree(
        &self,
        f: &mut fmt::Formatter<'_>,
        tasks: &[TaskSummary],
        parent: Option<TaskId>,
        depth: usize,
    ) -> fmt::Result {
        let known = |id: TaskId| tasks.iter().any(|t| t.task == id);
        for task in tasks {
            let is_child = match parent {
                Some(parent) => task.parent == Some(parent),
                None => task.parent.is_none_or(|p| !known(p)),
            };
            if !is_child {
                continue;
            }
            write!(f, "    {}{} {} [{:?}]", "  ".repeat(depth), task.task, task.name, task.state)?;
            if let Some(reason) = &task.blocked_on {
                write!(f, " waiting on {}", reason)?;
            }
            writeln!(f)?;
            self.fmt_tree(f, tasks, Some(task.task), depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for DomainReport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "{}: {} live task(s), {} pending remote op(s)",
            self.domain, self.live_tasks, self.pending_ops
        )?;
        if !self.complete {
            write!(f, " (incomplete)")?;
        }
        writeln!(f)?;

        if let Some(blocked) = &self.blocked {
            writeln!(f, "  blocked tasks: {}", blocked.len())?;
            for task in blocked {
                writeln!(f, "    {} {} waiting on {}", task.task, task.name, task.blocked_on)?;
            }
        }
        if let Some(tasks) = &self.tasks {
            writeln!(f, "  task tree:")?;
            self.fmt_tree(f, tasks, None, 0)?;
        }
        Ok(())
    }
}

/// Snapshot of every domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterReport {
    pub domains: Vec<DomainReport>,
}

impl ClusterReport {
    pub fn collect<'a>(
        domains: impl IntoIterator<Item = &'a ExecutionDomain>,
        block_report: bool,
        task_report: bool,
    ) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|domain| DomainReport::collect(domain, block_report, task_report))
                .collect(),
        }
    }

    /// Total suspended tasks across domains, when block reports are on.
    pub fn blocked_tasks(&self) -> usize {
        self.domains
            .iter()
            .filter_map(|d| d.blocked.as_ref())
            .map(Vec::len)
            .sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        for domain in &self.domains {
            write!(f, "{}", domain)?;
        }
        Ok(())
    }
}
