//! Operator summaries rendered from store items.

use std::collections::BTreeMap;

use crate::item::{Item, ItemStatus, Priority};

/// How many in-progress rows the status summary lists.
pub const TOP_IN_PROGRESS_DISPLAY: usize = 3;

fn count_status(items: &[Item], status: ItemStatus) -> usize {
    items.iter().filter(|i| i.status == status).count()
}

/// `summary PENDING=.. IN_PROGRESS=.. ...` plus the oldest in-progress
/// rows.
pub fn status_summary(items: &[Item]) -> String {
    let order = [
        ItemStatus::Pending,
        ItemStatus::InProgress,
        ItemStatus::Blocked,
        ItemStatus::Failed,
        ItemStatus::Done,
    ];
    let summary = order
        .iter()
        .map(|s| format!("{}={}", s.as_str(), count_status(items, *s)))
        .collect::<Vec<_>>()
        .join(" ");

    let in_progress: Vec<&Item> = items
        .iter()
        .filter(|i| i.status == ItemStatus::InProgress)
        .take(TOP_IN_PROGRESS_DISPLAY)
        .collect();

    let mut lines = vec![format!("summary {summary}")];
    if in_progress.is_empty() {
        lines.push("top_in_progress: none".to_string());
    } else {
        lines.push("top_in_progress:".to_string());
        for item in in_progress {
            lines.push(format!(
                "- {} ({}) owner={} started={}",
                item.id, item.priority, item.owner_session, item.started_at
            ));
        }
    }
    lines.join("\n")
}

/// Per-owner distribution of IN_PROGRESS work.
pub fn workers_summary(items: &[Item]) -> String {
    let in_progress: Vec<&Item> = items
        .iter()
        .filter(|i| i.status == ItemStatus::InProgress)
        .collect();
    if in_progress.is_empty() {
        return "workers: none".to_string();
    }

    // BTreeMap keeps the owner listing sorted.
    let mut grouped: BTreeMap<&str, Vec<&Item>> = BTreeMap::new();
    for item in &in_progress {
        let owner = if item.owner_session.is_empty() {
            "-"
        } else {
            item.owner_session.as_str()
        };
        grouped.entry(owner).or_default().push(item);
    }

    let mut lines = vec![format!(
        "workers_active={} in_progress={}",
        grouped.len(),
        in_progress.len()
    )];
    for (owner, tasks) in &grouped {
        let ids = tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>().join(",");
        let oldest = tasks
            .iter()
            .map(|t| t.started_at.as_str())
            .find(|s| !s.is_empty() && *s != "-")
            .unwrap_or("-");
        let count_priority =
            |p: Priority| tasks.iter().filter(|t| t.priority == p).count();
        lines.push(format!(
            "- {} tasks={} p0={} p1={} p2={} ids={} oldest_start={}",
            owner,
            tasks.len(),
            count_priority(Priority::P0),
            count_priority(Priority::P1),
            count_priority(Priority::P2),
            ids,
            oldest
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, status: ItemStatus, priority: Priority, owner: &str, started: &str) -> Item {
        Item {
            id: id.to_string(),
            status,
            priority,
            task: "task".to_string(),
            success_criteria: "c".to_string(),
            owner_session: owner.to_string(),
            started_at: started.to_string(),
            due_at: "-".to_string(),
            notes: String::new(),
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: 3,
            last_error: String::new(),
            idempotency_key: None,
            created_at: "2026-01-01 09:00".to_string(),
            updated_at: "2026-01-01 09:00".to_string(),
        }
    }

    #[test]
    fn status_summary_counts_every_state() {
        let items = vec![
            item("A", ItemStatus::Pending, Priority::P1, "-", "-"),
            item("B", ItemStatus::Failed, Priority::P0, "-", "-"),
            item("C", ItemStatus::InProgress, Priority::P2, "s1", "2026-01-01 10:00"),
        ];
        let out = status_summary(&items);
        assert!(out.starts_with("summary PENDING=1 IN_PROGRESS=1 BLOCKED=0 FAILED=1 DONE=0"));
        assert!(out.contains("- C (P2) owner=s1 started=2026-01-01 10:00"));
    }

    #[test]
    fn status_summary_without_running_work() {
        let items = vec![item("A", ItemStatus::Pending, Priority::P1, "-", "-")];
        let out = status_summary(&items);
        assert!(out.contains("top_in_progress: none"));
    }

    #[test]
    fn status_summary_caps_top_list() {
        let items: Vec<Item> = (0..5)
            .map(|i| {
                item(
                    &format!("T{i}"),
                    ItemStatus::InProgress,
                    Priority::P1,
                    "s",
                    "2026-01-01 10:00",
                )
            })
            .collect();
        let out = status_summary(&items);
        let bullet_count = out.lines().filter(|l| l.starts_with("- ")).count();
        assert_eq!(bullet_count, TOP_IN_PROGRESS_DISPLAY);
    }

    #[test]
    fn workers_summary_groups_by_owner() {
        let items = vec![
            item("A", ItemStatus::InProgress, Priority::P0, "w1", "2026-01-01 10:00"),
            item("B", ItemStatus::InProgress, Priority::P2, "w1", "2026-01-01 11:00"),
            item("C", ItemStatus::InProgress, Priority::P1, "w2", "2026-01-01 09:00"),
            item("D", ItemStatus::Pending, Priority::P1, "-", "-"),
        ];
        let out = workers_summary(&items);
        assert!(out.starts_with("workers_active=2 in_progress=3"));
        assert!(out.contains("- w1 tasks=2 p0=1 p1=0 p2=1 ids=A,B oldest_start=2026-01-01 10:00"));
        assert!(out.contains("- w2 tasks=1 p0=0 p1=1 p2=0 ids=C oldest_start=2026-01-01 09:00"));
    }

    #[test]
    fn workers_summary_empty() {
        let items = vec![item("A", ItemStatus::Done, Priority::P1, "-", "-")];
        assert_eq!(workers_summary(&items), "workers: none");
    }
}
