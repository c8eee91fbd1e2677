use serde::Serialize;

use crate::domain::{ColumnKey, ColumnSpec, RowKey, SampleRow, TileLink};
use crate::filter::{ColumnFilterArg, FilterStage};
use crate::page::PaginationStage;
use crate::table::{SourceTable, TableEvent, TableModel, prefers_full_reset};

pub type ChangeListener = Box<dyn FnMut(&TableEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshApplied {
    Replaced,
    Patched { changed_cells: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct PageColumn {
    pub key: ColumnKey,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRow {
    pub key: String,
    pub missing_sample: bool,
    pub cells: Vec<String>,
    pub links: Vec<TileLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageSnapshot {
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_rows: usize,
    pub source_rows: usize,
    pub filters: Vec<String>,
    pub columns: Vec<PageColumn>,
    pub rows: Vec<PageRow>,
}

/// The table → filter → page pipeline as seen by a renderer. Columns are
/// the visible subset of the source columns, in source order.
pub struct ListingView {
    pipeline: PaginationStage<FilterStage<SourceTable>>,
    visible: Vec<ColumnKey>,
    listeners: Vec<ChangeListener>,
}

impl ListingView {
    pub fn new(columns: Vec<ColumnSpec>, page_size: usize) -> Self {
        let visible = columns
            .iter()
            .filter(|column| column.default_visible)
            .map(|column| column.key)
            .collect();
        Self {
            pipeline: PaginationStage::new(FilterStage::new(SourceTable::new(columns)), page_size),
            visible,
            listeners: Vec::new(),
        }
    }

    pub fn on_changed<F>(&mut self, listener: F)
    where
        F: FnMut(&TableEvent) + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn table(&self) -> &SourceTable {
        self.pipeline.source().source()
    }

    pub fn filter(&self) -> &FilterStage<SourceTable> {
        self.pipeline.source()
    }

    pub fn pagination(&self) -> &PaginationStage<FilterStage<SourceTable>> {
        &self.pipeline
    }

    pub fn visible_columns(&self) -> &[ColumnKey] {
        &self.visible
    }

    pub fn set_column_visible(&mut self, key: ColumnKey, visible: bool) {
        let present = self.visible.contains(&key);
        if visible == present {
            return;
        }
        if visible {
            let order: Vec<ColumnKey> = self.table().columns().iter().map(|c| c.key).collect();
            self.visible.push(key);
            self.visible
                .sort_by_key(|k| order.iter().position(|o| o == k));
        } else {
            self.visible.retain(|k| *k != key);
        }
        self.emit(TableEvent::Reset);
    }

    pub fn set_rows(&mut self, rows: Vec<SampleRow>) {
        let event = self.table_mut().set_rows(rows);
        self.emit(event);
    }

    /// Rebuilds on a large row-count swing or an empty table, patches in
    /// place otherwise.
    pub fn apply_refresh(&mut self, rows: Vec<SampleRow>) -> RefreshApplied {
        if prefers_full_reset(self.table().row_count(), rows.len()) {
            self.set_rows(rows);
            return RefreshApplied::Replaced;
        }
        let events = self.table_mut().update_rows_partially(&rows);
        let changed_cells = events.len();
        self.forward(events);
        RefreshApplied::Patched { changed_cells }
    }

    pub fn remove_row(&mut self, key: &RowKey) -> bool {
        match self.table_mut().remove_row(key) {
            Some(event) => {
                self.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn apply_filter(&mut self, arg: &ColumnFilterArg) {
        self.pipeline.source_mut().apply(arg);
        self.emit(TableEvent::Reset);
    }

    pub fn set_text_filter(&mut self, column: ColumnKey, pattern: &str) {
        self.pipeline.source_mut().set_text_filter(column, pattern);
        self.emit(TableEvent::Reset);
    }

    pub fn set_range_filter(&mut self, column: ColumnKey, min: Option<i64>, max: Option<i64>) {
        self.pipeline.source_mut().set_range_filter(column, min, max);
        self.emit(TableEvent::Reset);
    }

    pub fn clear_filters(&mut self) {
        self.pipeline.source_mut().clear();
        self.emit(TableEvent::Reset);
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.pipeline.set_page_size(page_size);
        self.emit(TableEvent::Reset);
    }

    pub fn set_page(&mut self, page: usize) {
        if self.pipeline.set_page(page) {
            self.emit(TableEvent::Reset);
        }
    }

    pub fn next_page(&mut self) {
        if self.pipeline.next_page() {
            self.emit(TableEvent::Reset);
        }
    }

    pub fn prev_page(&mut self) {
        if self.pipeline.prev_page() {
            self.emit(TableEvent::Reset);
        }
    }

    /// Every row passing the filters, in table order, ignoring paging.
    pub fn filtered_rows(&self) -> impl Iterator<Item = &SampleRow> + '_ {
        let filter = self.filter();
        (0..filter.row_count())
            .filter_map(move |row| filter.map_to_source(row))
            .filter_map(move |source_row| self.table().row(source_row))
    }

    pub fn visible_labels(&self) -> Vec<String> {
        self.visible.iter().map(|key| self.label_for(*key)).collect()
    }

    /// Source row shown at a given page row.
    pub fn row_at(&self, row: usize) -> Option<&SampleRow> {
        let source_row = self.pipeline.map_to_source(row)?;
        self.table().row(source_row)
    }

    pub fn snapshot(&self) -> PageSnapshot {
        let columns = self
            .visible
            .iter()
            .map(|key| PageColumn {
                key: *key,
                label: self.label_for(*key),
            })
            .collect();
        let rows = (0..self.row_count())
            .filter_map(|row| self.row_at(row))
            .map(|row| PageRow {
                key: row.key().to_string(),
                missing_sample: row.missing_sample,
                cells: self.visible.iter().map(|key| row.cell(*key)).collect(),
                links: row.tile_dataset_grant_links.clone(),
            })
            .collect();
        PageSnapshot {
            page: self.pipeline.page(),
            page_size: self.pipeline.page_size(),
            total_pages: self.pipeline.total_pages(),
            total_rows: self.pipeline.total_rows(),
            source_rows: self.table().row_count(),
            filters: self
                .filter()
                .filters()
                .iter()
                .map(|(key, filter)| format!("{key}={filter}"))
                .collect(),
            columns,
            rows,
        }
    }

    fn label_for(&self, key: ColumnKey) -> String {
        self.table()
            .columns()
            .iter()
            .find(|column| column.key == key)
            .map(|column| column.label.clone())
            .unwrap_or_else(|| key.label().to_string())
    }

    fn table_mut(&mut self) -> &mut SourceTable {
        self.pipeline.source_mut().source_mut()
    }

    fn source_column(&self, view_column: usize) -> Option<usize> {
        let key = self.visible.get(view_column)?;
        self.table().column_index(*key)
    }

    /// Narrows source events to page coordinates. Changes that may alter
    /// filter membership collapse into a reset.
    fn forward(&mut self, events: Vec<TableEvent>) {
        let mut translated = Vec::new();
        for event in events {
            let TableEvent::CellsChanged { rows, columns } = event else {
                translated = vec![TableEvent::Reset];
                break;
            };
            let filtered = columns
                .clone()
                .filter_map(|column| self.table().column_key(column))
                .any(|key| self.filter().filter_for(key).is_some());
            if filtered {
                translated = vec![TableEvent::Reset];
                break;
            }
            for source_row in rows {
                let Some(page_row) = self
                    .filter()
                    .position_of_source(source_row)
                    .and_then(|filtered_row| self.pipeline.position_of(filtered_row))
                else {
                    continue;
                };
                for column in columns.clone() {
                    let Some(key) = self.table().column_key(column) else {
                        continue;
                    };
                    if let Some(view_column) = self.visible.iter().position(|k| *k == key) {
                        translated.push(TableEvent::CellsChanged {
                            rows: page_row..page_row + 1,
                            columns: view_column..view_column + 1,
                        });
                    }
                }
            }
        }
        for event in translated {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: TableEvent) {
        for listener in &mut self.listeners {
            listener(&event);
        }
    }
}

impl TableModel for ListingView {
    fn row_count(&self) -> usize {
        self.pipeline.row_count()
    }

    fn column_count(&self) -> usize {
        self.visible.len()
    }

    fn cell_value(&self, row: usize, column: usize) -> Option<String> {
        let source_column = self.source_column(column)?;
        self.pipeline.cell_value(row, source_column)
    }

    fn header_label(&self, column: usize) -> Option<String> {
        let source_column = self.source_column(column)?;
        self.pipeline.header_label(source_column)
    }

    fn column_key(&self, column: usize) -> Option<ColumnKey> {
        self.visible.get(column).copied()
    }

    fn generation(&self) -> u64 {
        self.pipeline.generation()
    }

    fn map_to_source(&self, row: usize) -> Option<usize> {
        self.pipeline.map_to_source(row)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::domain::default_columns;

    fn row(sample: &str, name: &str) -> SampleRow {
        SampleRow {
            subgroup_id: "g1".to_string(),
            sample_id: sample.to_string(),
            sample_name: name.to_string(),
            ..SampleRow::default()
        }
    }

    fn recorded(view: &mut ListingView) -> Rc<RefCell<Vec<TableEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        view.on_changed(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    #[test]
    fn first_refresh_replaces() {
        let mut view = ListingView::new(default_columns(), 10);
        let events = recorded(&mut view);
        assert_eq!(view.apply_refresh(vec![row("s1", "a")]), RefreshApplied::Replaced);
        assert_eq!(*events.borrow(), vec![TableEvent::Reset]);
    }

    #[test]
    fn unfiltered_change_on_page_is_narrow() {
        let mut view = ListingView::new(default_columns(), 2);
        view.set_rows(vec![row("s1", "a"), row("s2", "b"), row("s3", "c")]);
        let events = recorded(&mut view);

        let applied = view.apply_refresh(vec![row("s2", "B"), row("s3", "C")]);
        assert_eq!(applied, RefreshApplied::Patched { changed_cells: 2 });

        let sample_column = view.visible_columns().iter().position(|k| *k == ColumnKey::SampleName).unwrap();
        // s3 lives on page 2, so only s2 is reported.
        assert_eq!(
            *events.borrow(),
            vec![TableEvent::CellsChanged {
                rows: 1..2,
                columns: sample_column..sample_column + 1
            }]
        );
        assert_eq!(view.cell_value(1, sample_column).as_deref(), Some("B"));
    }

    #[test]
    fn change_in_filtered_column_resets() {
        let mut view = ListingView::new(default_columns(), 10);
        view.set_rows(vec![row("s1", "alpha"), row("s2", "beta")]);
        view.set_text_filter(ColumnKey::SampleName, "alp");
        let events = recorded(&mut view);

        view.apply_refresh(vec![row("s2", "alpine")]);
        assert_eq!(*events.borrow(), vec![TableEvent::Reset]);
        assert_eq!(view.row_count(), 2);
    }

    #[test]
    fn identical_refresh_is_silent() {
        let mut view = ListingView::new(default_columns(), 10);
        view.set_rows(vec![row("s1", "a")]);
        let events = recorded(&mut view);
        view.apply_refresh(vec![row("s1", "a")]);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn snapshot_uses_visible_columns() {
        let mut view = ListingView::new(default_columns(), 10);
        view.set_rows(vec![row("s1", "a")]);
        view.set_column_visible(ColumnKey::NameKey, true);
        view.set_column_visible(ColumnKey::SubgroupId, false);

        let snapshot = view.snapshot();
        let keys: Vec<ColumnKey> = snapshot.columns.iter().map(|c| c.key).collect();
        assert!(keys.contains(&ColumnKey::NameKey));
        assert!(!keys.contains(&ColumnKey::SubgroupId));
        assert_eq!(*keys.last().unwrap(), ColumnKey::NameKey);
        assert_eq!(snapshot.rows[0].key, "g1/s1");
        assert_eq!(snapshot.rows[0].cells.len(), keys.len());
    }
}
