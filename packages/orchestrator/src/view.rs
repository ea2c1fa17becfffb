//! Tabular view of the queue: a pipe-delimited table embedded in a text
//! file, rebuilt from the store.
//!
//! The view is a projection, never the source of truth. Everything
//! outside the table region (header prose, trailing sections) is
//! preserved byte-for-byte across rebuilds, and rebuilding twice from
//! the same store yields identical output.
//!
//! Cells are sanitized on render (`\n` to space, `|` to `/`), which
//! makes the view lossy for user content containing pipes. The parser
//! insists on exactly 9 cells per row and surfaces `SchemaMismatch`
//! otherwise.

use std::path::Path;

use crate::error::{Result, StoreError};
use crate::item::Item;

pub const VIEW_HEADER: &str =
    "| id | status | priority | task | success_criteria | owner_session | started_at | due_at | notes |";
pub const VIEW_SEPARATOR: &str = "|---|---|---|---|---|---|---|---|---|";

const CELL_COUNT: usize = 9;

/// One parsed row of the view table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    pub id: String,
    pub status: String,
    pub priority: String,
    pub task: String,
    pub success_criteria: String,
    pub owner_session: String,
    pub started_at: String,
    pub due_at: String,
    pub notes: String,
}

impl ViewRow {
    fn from_cells(cells: Vec<String>) -> Self {
        let mut it = cells.into_iter();
        Self {
            id: it.next().unwrap_or_default(),
            status: it.next().unwrap_or_default(),
            priority: it.next().unwrap_or_default(),
            task: it.next().unwrap_or_default(),
            success_criteria: it.next().unwrap_or_default(),
            owner_session: it.next().unwrap_or_default(),
            started_at: it.next().unwrap_or_default(),
            due_at: it.next().unwrap_or_default(),
            notes: it.next().unwrap_or_default(),
        }
    }

    fn to_cells(&self) -> [&str; CELL_COUNT] {
        [
            &self.id,
            &self.status,
            &self.priority,
            &self.task,
            &self.success_criteria,
            &self.owner_session,
            &self.started_at,
            &self.due_at,
            &self.notes,
        ]
    }

    pub fn from_item(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            status: item.status.as_str().to_string(),
            priority: item.priority.as_str().to_string(),
            task: item.task.clone(),
            success_criteria: item.success_criteria.clone(),
            owner_session: item.owner_session.clone(),
            started_at: item.started_at.clone(),
            due_at: item.due_at.clone(),
            notes: item.notes.clone(),
        }
    }
}

/// The view file, split into preserved prefix/suffix and parsed rows.
#[derive(Debug, Clone)]
pub struct ViewFile {
    lines: Vec<String>,
    table_start: usize,
    table_end: usize,
    pub rows: Vec<ViewRow>,
}

fn sanitize_cell(value: &str) -> String {
    value.replace('\n', " ").replace('|', "/").trim().to_string()
}

fn split_row(line: &str) -> Result<Vec<String>> {
    let trimmed = line.trim().trim_matches('|');
    let cells: Vec<String> = trimmed.split('|').map(|c| c.trim().to_string()).collect();
    if cells.len() != CELL_COUNT {
        return Err(StoreError::SchemaMismatch(format!(
            "expected {CELL_COUNT} cells in row, got {}: {line}",
            cells.len()
        )));
    }
    Ok(cells)
}

impl ViewFile {
    /// Parse an existing view file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();

        let table_start = lines
            .iter()
            .position(|l| l.trim().starts_with("| id | status | priority | task |"))
            .ok_or_else(|| {
                StoreError::SchemaMismatch("queue table header not found".to_string())
            })?;

        let mut table_end = lines.len();
        for (i, line) in lines.iter().enumerate().skip(table_start + 2) {
            if !line.trim().starts_with('|') {
                table_end = i;
                break;
            }
        }

        let mut rows = Vec::new();
        for line in &lines[table_start + 2..table_end] {
            if line.trim().is_empty() || !line.trim().starts_with('|') {
                continue;
            }
            rows.push(ViewRow::from_cells(split_row(line)?));
        }

        Ok(Self {
            lines,
            table_start,
            table_end,
            rows,
        })
    }

    /// A view with no surrounding prose, used when the file does not
    /// exist yet.
    pub fn empty() -> Self {
        Self {
            lines: vec![VIEW_HEADER.to_string(), VIEW_SEPARATOR.to_string()],
            table_start: 0,
            table_end: 2,
            rows: Vec::new(),
        }
    }

    /// Load the file, falling back to an empty scaffold when missing.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::empty())
        }
    }

    fn row_to_line(row: &ViewRow) -> String {
        let cells: Vec<String> = row.to_cells().iter().map(|c| sanitize_cell(c)).collect();
        format!("| {} |", cells.join(" | "))
    }

    pub fn render(&self) -> String {
        let header = &self.lines[self.table_start];
        let separator = &self.lines[self.table_start + 1];

        let mut out: Vec<String> = Vec::new();
        out.extend(self.lines[..self.table_start].iter().cloned());
        out.push(header.clone());
        out.push(separator.clone());
        out.extend(self.rows.iter().map(Self::row_to_line));
        out.extend(self.lines[self.table_end..].iter().cloned());
        format!("{}\n", out.join("\n"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<&ViewRow> {
        self.rows
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Rebuild the view's table body from store items, preserving everything
/// outside the table. Returns the row count.
pub fn project(items: &[Item], view_path: &Path) -> Result<usize> {
    let mut view = ViewFile::load_or_empty(view_path)?;
    view.rows = items.iter().map(ViewRow::from_item).collect();
    view.save(view_path)?;
    Ok(view.rows.len())
}

/// One disagreement between store and view on a compared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMismatch {
    pub id: String,
    pub field: &'static str,
    pub store_value: String,
    pub view_value: String,
}

/// Result of comparing the view against the store.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    pub missing_in_view: Vec<String>,
    pub missing_in_store: Vec<String>,
    pub mismatches: Vec<FieldMismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_in_view.is_empty()
            && self.missing_in_store.is_empty()
            && self.mismatches.is_empty()
    }
}

/// Compare by id-set and the fixed field set
/// {status, priority, owner_session, started_at, due_at}.
pub fn check_consistency(items: &[Item], rows: &[ViewRow]) -> ConsistencyReport {
    let mut report = ConsistencyReport::default();

    for item in items {
        let Some(row) = rows.iter().find(|r| r.id == item.id) else {
            report.missing_in_view.push(item.id.clone());
            continue;
        };

        let checks: [(&'static str, &str, &str); 5] = [
            ("status", item.status.as_str(), &row.status),
            ("priority", item.priority.as_str(), &row.priority),
            ("owner_session", &item.owner_session, &row.owner_session),
            ("started_at", &item.started_at, &row.started_at),
            ("due_at", &item.due_at, &row.due_at),
        ];
        for (field, store_value, view_value) in checks {
            if store_value != view_value {
                report.mismatches.push(FieldMismatch {
                    id: item.id.clone(),
                    field,
                    store_value: store_value.to_string(),
                    view_value: view_value.to_string(),
                });
            }
        }
    }

    for row in rows {
        if !items.iter().any(|i| i.id == row.id) {
            report.missing_in_store.push(row.id.clone());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemStatus, Priority};

    const SAMPLE: &str = "# Orchestrator Queue\n\n## Queue\n\n\
| id | status | priority | task | success_criteria | owner_session | started_at | due_at | notes |\n\
|---|---|---|---|---|---|---|---|---|\n\
| ORCH-100 | PENDING | P1 | task one | c1 | - | - | - | n1 |\n\
| ORCH-101 | IN_PROGRESS | P0 | task zero | c2 | s1 | 2026-01-01 10:00 | - | n2 |\n\
\n## Tail\nkeep me\n";

    fn sample_item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            status: ItemStatus::Pending,
            priority: Priority::P1,
            task: "task one".to_string(),
            success_criteria: "c1".to_string(),
            owner_session: "-".to_string(),
            started_at: "-".to_string(),
            due_at: "-".to_string(),
            notes: "n1".to_string(),
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
    fn parse_extracts_rows() {
        let view = ViewFile::parse(SAMPLE).unwrap();
        assert_eq!(view.rows.len(), 2);
        assert_eq!(view.rows[0].id, "ORCH-100");
        assert_eq!(view.rows[1].status, "IN_PROGRESS");
        assert_eq!(view.rows[1].started_at, "2026-01-01 10:00");
    }

    #[test]
    fn parse_missing_header_is_schema_mismatch() {
        let err = ViewFile::parse("just prose\n").unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));
    }

    #[test]
    fn parse_wrong_cell_count_is_schema_mismatch() {
        let bad = SAMPLE.replace(
            "| ORCH-100 | PENDING | P1 | task one | c1 | - | - | - | n1 |",
            "| ORCH-100 | PENDING | P1 |",
        );
        let err = ViewFile::parse(&bad).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));
    }

    #[test]
    fn render_preserves_surrounding_text() {
        let view = ViewFile::parse(SAMPLE).unwrap();
        let rendered = view.render();
        assert!(rendered.starts_with("# Orchestrator Queue\n"));
        assert!(rendered.contains("## Tail\nkeep me"));
    }

    #[test]
    fn render_parse_is_stable() {
        let view = ViewFile::parse(SAMPLE).unwrap();
        let once = view.render();
        let twice = ViewFile::parse(&once).unwrap().render();
        assert_eq!(once, twice);
    }

    #[test]
    fn cells_are_sanitized_on_render() {
        let mut view = ViewFile::parse(SAMPLE).unwrap();
        view.rows[0].task = "line\nbreak | pipe".to_string();
        let rendered = view.render();
        assert!(rendered.contains("line break / pipe"));
    }

    #[test]
    fn projection_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("QUEUE.md");
        std::fs::write(&path, SAMPLE).unwrap();

        let items = vec![sample_item("ORCH-100"), sample_item("ORCH-200")];
        project(&items, &path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        project(&items, &path).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("ORCH-200"));
        assert!(first.contains("## Tail"));
    }

    #[test]
    fn projection_creates_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sub").join("QUEUE.md");
        let count = project(&[sample_item("ORCH-1")], &path).unwrap();
        assert_eq!(count, 1);
        assert!(path.exists());
    }

    #[test]
    fn consistency_ok_when_aligned() {
        let item = sample_item("ORCH-100");
        let rows = vec![ViewRow::from_item(&item)];
        let report = check_consistency(&[item], &rows);
        assert!(report.is_consistent());
    }

    #[test]
    fn consistency_reports_missing_both_ways() {
        let item = sample_item("ONLY-STORE");
        let other = sample_item("ONLY-VIEW");
        let rows = vec![ViewRow::from_item(&other)];
        let report = check_consistency(&[item], &rows);
        assert_eq!(report.missing_in_view, vec!["ONLY-STORE".to_string()]);
        assert_eq!(report.missing_in_store, vec!["ONLY-VIEW".to_string()]);
    }

    #[test]
    fn consistency_reports_field_mismatch() {
        let item = sample_item("ORCH-100");
        let mut row = ViewRow::from_item(&item);
        row.status = "DONE".to_string();
        let report = check_consistency(&[item], &[row]);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].field, "status");
        assert_eq!(report.mismatches[0].view_value, "DONE");
    }

    #[test]
    fn find_by_id_misses_with_not_found() {
        let view = ViewFile::parse(SAMPLE).unwrap();
        assert!(view.find_by_id("ORCH-100").is_ok());
        assert!(matches!(
            view.find_by_id("NOPE").unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
