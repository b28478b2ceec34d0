use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_core::{TaskId, TasklaneError, TasklaneResult};
use tasklane_store::{Dependency, Metadata, Task, TaskStatus};

/// Wire format version written to and accepted from every line.
pub const OP_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// SyncOp
// ---------------------------------------------------------------------------

/// One line of the JSONL log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOp {
    pub v: u32,
    /// Last-writer-wins clock for the entity this op touches.
    #[serde(with = "tasklane_core::time::nanos")]
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Upsert {
        id: TaskId,
        data: TaskData,
    },
    Delete {
        id: TaskId,
    },
    DepAdd {
        #[serde(rename = "blockerId")]
        blocker_id: TaskId,
        #[serde(rename = "blockedId")]
        blocked_id: TaskId,
    },
    DepRemove {
        #[serde(rename = "blockerId")]
        blocker_id: TaskId,
        #[serde(rename = "blockedId")]
        blocked_id: TaskId,
    },
}

/// Task payload carried by an `upsert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(
        default,
        with = "tasklane_core::time::nanos::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "tasklane_core::time::nanos::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskData {
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            score: task.score,
            parent_id: task.parent_id.clone(),
            metadata: task.metadata.clone(),
            created_at: Some(task.created_at),
            completed_at: task.completed_at,
        }
    }

    /// Equal on the fields that describe the task, ignoring timestamps.
    pub fn same_content(&self, task: &Task) -> bool {
        self.title == task.title
            && self.description == task.description
            && self.status == task.status
            && self.score == task.score
            && self.parent_id == task.parent_id
            && self.metadata == task.metadata
    }
}

/// The entity an op applies to; ops on the same key compete under last-writer-wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Task(TaskId),
    Edge(TaskId, TaskId),
}

impl SyncOp {
    pub fn upsert(task: &Task) -> Self {
        Self {
            v: OP_VERSION,
            ts: task.updated_at,
            kind: OpKind::Upsert {
                id: task.id.clone(),
                data: TaskData::from_task(task),
            },
        }
    }

    pub fn delete(id: TaskId, ts: DateTime<Utc>) -> Self {
        Self {
            v: OP_VERSION,
            ts,
            kind: OpKind::Delete { id },
        }
    }

    pub fn dep_add(dep: &Dependency) -> Self {
        Self {
            v: OP_VERSION,
            ts: dep.created_at,
            kind: OpKind::DepAdd {
                blocker_id: dep.blocker_id.clone(),
                blocked_id: dep.blocked_id.clone(),
            },
        }
    }

    pub fn dep_remove(blocker_id: TaskId, blocked_id: TaskId, ts: DateTime<Utc>) -> Self {
        Self {
            v: OP_VERSION,
            ts,
            kind: OpKind::DepRemove {
                blocker_id,
                blocked_id,
            },
        }
    }

    pub fn key(&self) -> EntityKey {
        match &self.kind {
            OpKind::Upsert { id, .. } | OpKind::Delete { id } => EntityKey::Task(id.clone()),
            OpKind::DepAdd {
                blocker_id,
                blocked_id,
            }
            | OpKind::DepRemove {
                blocker_id,
                blocked_id,
            } => EntityKey::Edge(blocker_id.clone(), blocked_id.clone()),
        }
    }

    /// Checks serde cannot express: version, non-empty title, finite score, no self-loops.
    pub fn validate(&self) -> TasklaneResult<()> {
        if self.v != OP_VERSION {
            return Err(TasklaneError::Validation(format!(
                "unsupported op version {} (expected {OP_VERSION})",
                self.v
            )));
        }
        match &self.kind {
            OpKind::Upsert { id, data } => {
                if data.title.trim().is_empty() {
                    return Err(TasklaneError::Validation(format!(
                        "upsert {id} has an empty title"
                    )));
                }
                if !data.score.is_finite() {
                    return Err(TasklaneError::Validation(format!(
                        "upsert {id} has a non-finite score"
                    )));
                }
            }
            OpKind::Delete { .. } => {}
            OpKind::DepAdd {
                blocker_id,
                blocked_id,
            }
            | OpKind::DepRemove {
                blocker_id,
                blocked_id,
            } => {
                if blocker_id == blocked_id {
                    return Err(TasklaneError::Validation(format!(
                        "dependency {blocker_id} -> {blocked_id} is a self-loop"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate one line. `line_no` is 1-based and only used in errors.
pub fn parse_line(line_no: usize, line: &str) -> TasklaneResult<SyncOp> {
    let op: SyncOp = serde_json::from_str(line)
        .map_err(|e| TasklaneError::Validation(format!("line {line_no}: {e}")))?;
    op.validate()
        .map_err(|e| TasklaneError::Validation(format!("line {line_no}: {e}")))?;
    Ok(op)
}

/// Parse a whole log. Blank lines are ignored; any bad line fails the lot.
pub fn parse_ops(text: &str) -> TasklaneResult<Vec<SyncOp>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| parse_line(i + 1, line))
        .collect()
}

/// Serialize ops as JSONL, one object per line with a trailing newline.
pub fn render_ops(ops: &[SyncOp]) -> TasklaneResult<String> {
    let mut out = String::new();
    for op in ops {
        out.push_str(&serde_json::to_string(op)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const UPSERT: &str = r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-abc123","data":{"title":"Write tests","description":"","status":"backlog","score":2,"parentId":null,"metadata":{}}}"#;

    #[test]
    fn test_parse_upsert() {
        let op = parse_line(1, UPSERT).unwrap();
        assert_eq!(op.key(), EntityKey::Task(TaskId::parse("tx-abc123").unwrap()));
        match op.kind {
            OpKind::Upsert { data, .. } => {
                assert_eq!(data.title, "Write tests");
                assert_eq!(data.status, TaskStatus::Backlog);
                assert_eq!(data.score, 2.0);
                assert!(data.created_at.is_none());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let op = SyncOp::dep_remove(
            TaskId::parse("tx-aaaaaa").unwrap(),
            TaskId::parse("tx-bbbbbb").unwrap(),
            chrono::Utc::now(),
        );
        let json: serde_json::Value = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "dep_remove");
        assert_eq!(json["v"], 1);
        assert_eq!(json["blockerId"], "tx-aaaaaa");
        assert_eq!(json["blockedId"], "tx-bbbbbb");
    }

    #[test]
    fn test_rejects_bad_lines() {
        let cases = [
            r#"{"v":2,"op":"delete","ts":"2024-05-01T10:00:00Z","id":"tx-abc123"}"#,
            r#"{"v":1,"op":"explode","ts":"2024-05-01T10:00:00Z","id":"tx-abc123"}"#,
            r#"{"v":1,"op":"delete","ts":"last tuesday","id":"tx-abc123"}"#,
            r#"{"v":1,"op":"delete","ts":"2024-05-01T10:00:00Z","id":"TASK-1"}"#,
            r#"{"v":1,"op":"dep_add","ts":"2024-05-01T10:00:00Z","blockerId":"tx-abc123","blockedId":"tx-abc123"}"#,
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-abc123","data":{"title":"","status":"backlog"}}"#,
            "not json",
        ];
        for line in cases {
            assert!(
                matches!(parse_line(3, line), Err(TasklaneError::Validation(msg)) if msg.starts_with("line 3")),
                "accepted: {line}"
            );
        }
    }

    #[test]
    fn test_parse_ops_skips_blank_lines_and_reports_position() {
        let text = format!("{UPSERT}\n\n{UPSERT}\n");
        assert_eq!(parse_ops(&text).unwrap().len(), 2);

        let broken = format!("{UPSERT}\n{{\"v\":1}}\n");
        let err = parse_ops(&broken).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_render_then_parse() {
        let op = parse_line(1, UPSERT).unwrap();
        let text = render_ops(&[op.clone()]).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(parse_ops(&text).unwrap(), vec![op]);
    }
}
