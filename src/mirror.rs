//! Best-effort projection of the activity store into a spreadsheet.
//!
//! The engine hands out [`MirrorRow`]s after every durable mutation; callers
//! push them through a [`MirrorSink`] without waiting on the result.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::MirrorError;
use crate::store::UserId;

pub const HEADER: [&str; 9] = [
    "Discord User ID",
    "Display Name",
    "Lifetime (min)",
    "Lifetime (formatted)",
    "This Week (min)",
    "This Week (formatted)",
    "This Month (min)",
    "This Month (formatted)",
    "Last Updated",
];

/// Totals for one user as of the mutation that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub user_id: UserId,
    pub display_name: String,
    pub lifetime_minutes: u64,
    pub weekly_minutes: u64,
    pub monthly_minutes: u64,
}

#[async_trait]
pub trait MirrorSink: Send + Sync {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError>;
}

/// Used when no spreadsheet is configured.
pub struct NoopMirror;

#[async_trait]
impl MirrorSink for NoopMirror {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        debug!("Mirror disabled, dropping totals for {}", row.user_id);
        Ok(())
    }
}

/// Pushes rows on background tasks; failures are logged and forgotten.
pub fn push_all(sink: &Arc<dyn MirrorSink>, rows: Vec<MirrorRow>) {
    for row in rows {
        let sink = Arc::clone(sink);
        tokio::spawn(async move {
            if let Err(e) = sink.upsert(&row).await {
                warn!(
                    "Failed to mirror totals for {} ({}): {}",
                    row.display_name, row.user_id, e
                );
            }
        });
    }
}

pub fn format_minutes(minutes: u64) -> String {
    format!("{}h {}m", minutes / 60, minutes % 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueInput {
    Raw,
    UserEntered,
}

impl ValueInput {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueInput::Raw => "RAW",
            ValueInput::UserEntered => "USER_ENTERED",
        }
    }
}

/// Minimal slice of the spreadsheet values API the mirror needs.
///
/// Ranges are A1 notation without the tab prefix; implementations qualify
/// them with their own tab.
#[async_trait]
pub trait SheetValues: Send + Sync {
    async fn get(&self, range: &str) -> Result<Vec<Vec<String>>, MirrorError>;

    async fn update(
        &self,
        range: &str,
        rows: Vec<Vec<String>>,
        input: ValueInput,
    ) -> Result<(), MirrorError>;

    async fn append(&self, range: &str, rows: Vec<Vec<String>>) -> Result<(), MirrorError>;
}

/// Upserts one row per user: header check, lookup by id, update or append.
pub struct SheetMirror<V> {
    values: V,
    // lookup and write must not interleave, or two first pushes both append
    write_lock: Mutex<()>,
}

impl<V: SheetValues> SheetMirror<V> {
    pub fn new(values: V) -> Self {
        Self {
            values,
            write_lock: Mutex::new(()),
        }
    }

    async fn ensure_header(&self) -> Result<(), MirrorError> {
        let current = self.values.get("A1:I1").await?;
        let matches = current
            .first()
            .is_some_and(|row| row.iter().map(String::as_str).eq(HEADER));
        if !matches {
            debug!("Header mismatch, rewriting header row");
            let header: Vec<String> = HEADER.iter().map(|h| h.to_string()).collect();
            self.values
                .update("A1:I1", vec![header], ValueInput::Raw)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<V: SheetValues> MirrorSink for SheetMirror<V> {
    async fn upsert(&self, row: &MirrorRow) -> Result<(), MirrorError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_header().await?;

        let existing = self.values.get("A2:I").await?;
        let cells = row_cells(row);

        match find_row(&existing, row.user_id) {
            Some(index) => {
                let line = index + 2;
                self.values
                    .update(&format!("A{line}:I{line}"), vec![cells], ValueInput::UserEntered)
                    .await?;
            }
            None => {
                self.values.append("A:I", vec![cells]).await?;
            }
        }

        debug!("Mirrored totals for {} ({})", row.display_name, row.user_id);
        Ok(())
    }
}

/// Index into the data rows (below the header) holding this user.
pub fn find_row(rows: &[Vec<String>], user: UserId) -> Option<usize> {
    let wanted = user.to_string();
    rows.iter().position(|r| {
        r.first()
            .map(|cell| cell.strip_prefix('\'').unwrap_or(cell) == wanted)
            .unwrap_or(false)
    })
}

fn row_cells(row: &MirrorRow) -> Vec<String> {
    vec![
        // keeps the sheet from turning a snowflake into scientific notation
        format!("'{}", row.user_id),
        row.display_name.clone(),
        row.lifetime_minutes.to_string(),
        format_minutes(row.lifetime_minutes),
        row.weekly_minutes.to_string(),
        format_minutes(row.weekly_minutes),
        row.monthly_minutes.to_string(),
        format_minutes(row.monthly_minutes),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory grid standing in for a sheet tab. USER_ENTERED strips the
    /// leading apostrophe the same way the real API does.
    #[derive(Default)]
    struct MemorySheet {
        grid: StdMutex<Vec<Vec<String>>>,
    }

    fn first_row(range: &str) -> usize {
        let start = range.split(':').next().unwrap();
        start[1..].parse().unwrap_or(1)
    }

    fn entered(rows: Vec<Vec<String>>, input: ValueInput) -> Vec<Vec<String>> {
        if input == ValueInput::Raw {
            return rows;
        }
        rows.into_iter()
            .map(|r| {
                r.into_iter()
                    .map(|c| c.strip_prefix('\'').map(str::to_string).unwrap_or(c))
                    .collect()
            })
            .collect()
    }

    #[async_trait]
    impl SheetValues for MemorySheet {
        async fn get(&self, range: &str) -> Result<Vec<Vec<String>>, MirrorError> {
            let grid = self.grid.lock().unwrap();
            let start = first_row(range) - 1;
            let rows: Vec<_> = grid.iter().skip(start).cloned().collect();
            Ok(if range == "A1:I1" {
                rows.into_iter().take(1).collect()
            } else {
                rows
            })
        }

        async fn update(
            &self,
            range: &str,
            rows: Vec<Vec<String>>,
            input: ValueInput,
        ) -> Result<(), MirrorError> {
            let mut grid = self.grid.lock().unwrap();
            let start = first_row(range) - 1;
            for (offset, row) in entered(rows, input).into_iter().enumerate() {
                let index = start + offset;
                if grid.len() <= index {
                    grid.resize(index + 1, Vec::new());
                }
                grid[index] = row;
            }
            Ok(())
        }

        async fn append(&self, _range: &str, rows: Vec<Vec<String>>) -> Result<(), MirrorError> {
            let mut grid = self.grid.lock().unwrap();
            grid.extend(entered(rows, ValueInput::UserEntered));
            Ok(())
        }
    }

    fn row(user_id: UserId, lifetime: u64) -> MirrorRow {
        MirrorRow {
            user_id,
            display_name: format!("user{user_id}"),
            lifetime_minutes: lifetime,
            weekly_minutes: lifetime,
            monthly_minutes: lifetime,
        }
    }

    #[test]
    fn formats_hours_and_minutes() {
        assert_eq!(format_minutes(0), "0h 0m");
        assert_eq!(format_minutes(45), "0h 45m");
        assert_eq!(format_minutes(135), "2h 15m");
    }

    #[test]
    fn lookup_ignores_leading_apostrophe() {
        let rows = vec![
            vec!["'111".to_string(), "a".to_string()],
            vec!["222".to_string(), "b".to_string()],
        ];
        assert_eq!(find_row(&rows, 111), Some(0));
        assert_eq!(find_row(&rows, 222), Some(1));
        assert_eq!(find_row(&rows, 333), None);
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row_per_user() {
        let mirror = SheetMirror::new(MemorySheet::default());

        mirror.upsert(&row(111, 45)).await.unwrap();
        mirror.upsert(&row(111, 45)).await.unwrap();
        mirror.upsert(&row(222, 10)).await.unwrap();
        mirror.upsert(&row(111, 60)).await.unwrap();

        let grid = mirror.values.grid.lock().unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid[0], HEADER.map(String::from).to_vec());
        assert_eq!(grid[1][0], "111");
        assert_eq!(grid[1][2], "60");
        assert_eq!(grid[1][3], "1h 0m");
        assert_eq!(grid[2][0], "222");
    }

    #[tokio::test]
    async fn stale_header_is_repaired() {
        let sheet = MemorySheet::default();
        sheet
            .grid
            .lock()
            .unwrap()
            .push(vec!["User".to_string(), "Minutes".to_string()]);
        let mirror = SheetMirror::new(sheet);

        mirror.ensure_header().await.unwrap();

        let grid = mirror.values.grid.lock().unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid[0][8], "Last Updated");
    }
}
