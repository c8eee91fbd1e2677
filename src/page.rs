use std::cell::Cell;

use crate::domain::ColumnKey;
use crate::table::TableModel;

/// Exposes exactly one page of the wrapped model. A page size of 0 shows
/// every row. The page number is 1-based and is clamped whenever the
/// wrapped row count shrinks.
#[derive(Debug)]
pub struct PaginationStage<M: TableModel> {
    source: M,
    page_size: usize,
    page: Cell<usize>,
    revision: u64,
}

impl<M: TableModel> PaginationStage<M> {
    pub fn new(source: M, page_size: usize) -> Self {
        Self {
            source,
            page_size,
            page: Cell::new(1),
            revision: 0,
        }
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut M {
        &mut self.source
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
        self.page.set(1);
        self.revision += 1;
    }

    pub fn total_rows(&self) -> usize {
        self.source.row_count()
    }

    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            return 1;
        }
        self.total_rows().div_ceil(self.page_size).max(1)
    }

    pub fn page(&self) -> usize {
        let clamped = self.page.get().clamp(1, self.total_pages());
        self.page.set(clamped);
        clamped
    }

    /// Returns whether the visible page changed.
    pub fn set_page(&mut self, page: usize) -> bool {
        let before = self.page();
        let target = page.clamp(1, self.total_pages());
        self.page.set(target);
        if target != before {
            self.revision += 1;
        }
        target != before
    }

    pub fn next_page(&mut self) -> bool {
        let page = self.page();
        self.set_page(page + 1)
    }

    pub fn prev_page(&mut self) -> bool {
        let page = self.page();
        self.set_page(page.saturating_sub(1))
    }

    pub fn offset(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            (self.page() - 1) * self.page_size
        }
    }

    /// Row of this page showing the given row of the wrapped model.
    pub fn position_of(&self, source_row: usize) -> Option<usize> {
        let offset = self.offset();
        (source_row >= offset && source_row < offset + self.row_count()).then(|| source_row - offset)
    }
}

impl<M: TableModel> TableModel for PaginationStage<M> {
    fn row_count(&self) -> usize {
        let total = self.total_rows();
        if self.page_size == 0 {
            return total;
        }
        self.page_size.min(total.saturating_sub(self.offset()))
    }

    fn column_count(&self) -> usize {
        self.source.column_count()
    }

    fn cell_value(&self, row: usize, column: usize) -> Option<String> {
        if row >= self.row_count() {
            return None;
        }
        self.source.cell_value(self.offset() + row, column)
    }

    fn header_label(&self, column: usize) -> Option<String> {
        self.source.header_label(column)
    }

    fn column_key(&self, column: usize) -> Option<ColumnKey> {
        self.source.column_key(column)
    }

    fn generation(&self) -> u64 {
        self.source.generation() + self.revision
    }

    fn map_to_source(&self, row: usize) -> Option<usize> {
        if row >= self.row_count() {
            return None;
        }
        self.source.map_to_source(self.offset() + row)
    }
}
