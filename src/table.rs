use std::collections::HashMap;
use std::ops::Range;

use crate::domain::{ColumnKey, ColumnSpec, RowKey, SampleRow, default_columns};

/// Minimum row-count delta before a refresh rebuilds instead of diffing.
pub const FULL_RESET_MIN_DELTA: usize = 200;

/// Read side shared by the source table and every stage stacked on it.
pub trait TableModel {
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;
    fn cell_value(&self, row: usize, column: usize) -> Option<String>;
    fn header_label(&self, column: usize) -> Option<String>;
    fn column_key(&self, column: usize) -> Option<ColumnKey>;
    /// Bumped whenever the visible content may have changed.
    fn generation(&self) -> u64;
    fn map_to_source(&self, row: usize) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    Reset,
    CellsChanged {
        rows: Range<usize>,
        columns: Range<usize>,
    },
}

/// Whether replacing `old` rows by `new` rows should rebuild the table.
pub fn prefers_full_reset(old: usize, new: usize) -> bool {
    old == 0 || old.abs_diff(new) > FULL_RESET_MIN_DELTA.max(old / 3)
}

#[derive(Debug)]
pub struct SourceTable {
    columns: Vec<ColumnSpec>,
    rows: Vec<SampleRow>,
    index: HashMap<RowKey, usize>,
    generation: u64,
}

impl Default for SourceTable {
    fn default() -> Self {
        Self::new(default_columns())
    }
}

impl SourceTable {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            index: HashMap::new(),
            generation: 0,
        }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> &[SampleRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&SampleRow> {
        self.rows.get(index)
    }

    pub fn find(&self, key: &RowKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn column_index(&self, key: ColumnKey) -> Option<usize> {
        self.columns.iter().position(|column| column.key == key)
    }

    pub fn set_columns(&mut self, columns: Vec<ColumnSpec>) -> TableEvent {
        self.columns = columns;
        self.generation += 1;
        TableEvent::Reset
    }

    pub fn set_rows(&mut self, rows: Vec<SampleRow>) -> TableEvent {
        self.rows = rows;
        self.reindex();
        self.generation += 1;
        TableEvent::Reset
    }

    /// Patches rows in place by key. Only cells whose rendering changed are
    /// touched and reported. Rows with unknown keys are dropped.
    pub fn update_rows_partially(&mut self, new_rows: &[SampleRow]) -> Vec<TableEvent> {
        let mut events = Vec::new();
        let mut dropped = 0usize;
        for new_row in new_rows {
            let Some(&index) = self.index.get(&new_row.key()) else {
                dropped += 1;
                continue;
            };
            let row = &mut self.rows[index];
            // Linked columns are assigned as a group, so compare against the
            // untouched row before assigning anything.
            let changed: Vec<usize> = self
                .columns
                .iter()
                .enumerate()
                .filter(|(_, column)| row.cell(column.key) != new_row.cell(column.key))
                .map(|(column_index, _)| column_index)
                .collect();
            for &column_index in &changed {
                row.assign_column(self.columns[column_index].key, new_row);
                events.push(TableEvent::CellsChanged {
                    rows: index..index + 1,
                    columns: column_index..column_index + 1,
                });
            }
            row.missing_sample = new_row.missing_sample;
        }
        if !events.is_empty() {
            self.generation += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "partial update skipped rows without a known key");
        }
        events
    }

    pub fn remove_row(&mut self, key: &RowKey) -> Option<TableEvent> {
        let index = self.find(key)?;
        self.rows.remove(index);
        self.reindex();
        self.generation += 1;
        Some(TableEvent::Reset)
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| (row.key(), index))
            .collect();
    }
}

impl TableModel for SourceTable {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn cell_value(&self, row: usize, column: usize) -> Option<String> {
        let column = self.columns.get(column)?;
        self.rows.get(row).map(|row| row.cell(column.key))
    }

    fn header_label(&self, column: usize) -> Option<String> {
        self.columns.get(column).map(|column| column.label.clone())
    }

    fn column_key(&self, column: usize) -> Option<ColumnKey> {
        self.columns.get(column).map(|column| column.key)
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn map_to_source(&self, row: usize) -> Option<usize> {
        (row < self.rows.len()).then_some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TileLink;

    fn row(subgroup: &str, sample: &str, name: &str) -> SampleRow {
        SampleRow {
            subgroup_id: subgroup.to_string(),
            sample_id: sample.to_string(),
            sample_name: name.to_string(),
            ..SampleRow::default()
        }
    }

    #[test]
    fn identical_update_emits_nothing() {
        let mut table = SourceTable::default();
        table.set_rows(vec![row("g1", "s1", "a"), row("g1", "s2", "b")]);
        let generation = table.generation();

        let events = table.update_rows_partially(&[row("g1", "s1", "a"), row("g1", "s2", "b")]);
        assert!(events.is_empty());
        assert_eq!(table.generation(), generation);
    }

    #[test]
    fn changed_cell_emits_narrow_event() {
        let mut table = SourceTable::default();
        table.set_rows(vec![row("g1", "s1", "a"), row("g1", "s2", "b")]);

        let events = table.update_rows_partially(&[row("g1", "s2", "renamed")]);
        let column = table.column_index(ColumnKey::SampleName).unwrap();
        assert_eq!(
            events,
            vec![TableEvent::CellsChanged {
                rows: 1..2,
                columns: column..column + 1
            }]
        );
        assert_eq!(table.row(1).unwrap().sample_name, "renamed");
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let mut table = SourceTable::default();
        table.set_rows(vec![row("g1", "s1", "a")]);
        let events = table.update_rows_partially(&[row("g1", "s9", "new")]);
        assert!(events.is_empty());
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn aligned_lists_move_together() {
        let mut table = SourceTable::default();
        let mut original = row("g1", "s1", "a");
        original.set_links(vec![
            TileLink::new("e1", "t1", "d1", "set 1", Vec::new()),
            TileLink::new("e2", "t2", "d2", "set 2", Vec::new()),
        ]);
        table.set_rows(vec![original]);

        let mut updated = row("g1", "s1", "a");
        updated.set_links(vec![
            TileLink::new("e2", "t2", "d2", "set 2", Vec::new()),
            TileLink::new("e3", "t3", "d1", "set 1", Vec::new()),
        ]);
        let events = table.update_rows_partially(&[updated]);

        let patched = table.row(0).unwrap();
        assert!(patched.is_aligned());
        assert_eq!(patched.dataset_ids, vec!["d2", "d1"]);
        assert_eq!(patched.data_entry_ids, vec!["e2", "e3"]);

        let reported: Vec<ColumnKey> = events
            .iter()
            .filter_map(|event| match event {
                TableEvent::CellsChanged { rows, columns } => {
                    assert_eq!(*rows, 0..1);
                    table.column_key(columns.start)
                }
                TableEvent::Reset => None,
            })
            .collect();
        for key in [
            ColumnKey::TileDatasetGrant,
            ColumnKey::DatasetIds,
            ColumnKey::DatasetNames,
            ColumnKey::DataEntryIds,
            ColumnKey::DataEntryNames,
        ] {
            if table.column_index(key).is_some() {
                assert!(reported.contains(&key), "{key:?} changed but was not reported");
            }
        }
        assert!(!reported.contains(&ColumnKey::SampleName));
    }

    #[test]
    fn reset_heuristic() {
        assert!(prefers_full_reset(0, 5));
        assert!(!prefers_full_reset(10, 150));
        assert!(prefers_full_reset(10, 211));
        assert!(!prefers_full_reset(900, 650));
        assert!(prefers_full_reset(900, 599));
    }

    #[test]
    fn remove_row_reindexes() {
        let mut table = SourceTable::default();
        table.set_rows(vec![row("g1", "s1", "a"), row("g1", "s2", "b")]);
        assert_eq!(table.remove_row(&RowKey::new("g1", "s1")), Some(TableEvent::Reset));
        assert_eq!(table.find(&RowKey::new("g1", "s2")), Some(0));
        assert_eq!(table.remove_row(&RowKey::new("g1", "s1")), None);
    }
}
