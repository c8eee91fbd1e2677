use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::domain::{ColumnKey, ColumnKind};
use crate::error::ListingError;
use crate::table::TableModel;

static NO_ROWS: Vec<usize> = Vec::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnFilter {
    /// Case-insensitive substring; stored lowercased.
    Text { pattern: String },
    /// Inclusive integer bounds.
    Range { min: Option<i64>, max: Option<i64> },
}

impl ColumnFilter {
    pub fn text(pattern: &str) -> Self {
        ColumnFilter::Text {
            pattern: pattern.trim().to_lowercase(),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            ColumnFilter::Text { pattern } => {
                pattern.is_empty() || value.to_lowercase().contains(pattern.as_str())
            }
            ColumnFilter::Range { min, max } => {
                let Ok(number) = value.trim().parse::<i64>() else {
                    return false;
                };
                min.is_none_or(|min| number >= min) && max.is_none_or(|max| number <= max)
            }
        }
    }
}

impl fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnFilter::Text { pattern } => write!(f, "~{pattern}"),
            ColumnFilter::Range { min, max } => {
                let bound = |value: &Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{}..{}", bound(min), bound(max))
            }
        }
    }
}

/// `key=text` or `key=min..max`, as typed on the command line or in the
/// browser's filter prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilterArg {
    pub column: ColumnKey,
    pub filter: ColumnFilter,
}

impl ColumnFilterArg {
    pub fn parse_range(value: &str) -> Result<Self, ListingError> {
        let (column, expr) = split_assignment(value)?;
        let (min, max) = expr
            .split_once("..")
            .ok_or_else(|| ListingError::InvalidFilter(value.to_string()))?;
        Ok(Self {
            column,
            filter: ColumnFilter::Range {
                min: parse_bound(min, value)?,
                max: parse_bound(max, value)?,
            },
        })
    }
}

impl FromStr for ColumnFilterArg {
    type Err = ListingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (column, expr) = split_assignment(value)?;
        if column.kind() == ColumnKind::Numeric && expr.contains("..") {
            return Self::parse_range(value);
        }
        Ok(Self {
            column,
            filter: ColumnFilter::text(expr),
        })
    }
}

fn split_assignment(value: &str) -> Result<(ColumnKey, &str), ListingError> {
    let (column, expr) = value
        .split_once('=')
        .ok_or_else(|| ListingError::InvalidFilter(value.to_string()))?;
    Ok((column.parse()?, expr))
}

fn parse_bound(bound: &str, original: &str) -> Result<Option<i64>, ListingError> {
    let bound = bound.trim();
    if bound.is_empty() {
        return Ok(None);
    }
    bound
        .parse()
        .map(Some)
        .map_err(|_| ListingError::InvalidFilter(original.to_string()))
}

/// View over a table keeping only rows that pass every active predicate.
/// The surviving row list is recomputed lazily after a source or predicate
/// change.
#[derive(Debug)]
pub struct FilterStage<M: TableModel> {
    source: M,
    filters: BTreeMap<ColumnKey, ColumnFilter>,
    revision: u64,
    visible: RefCell<Option<(u64, Vec<usize>)>>,
}

impl<M: TableModel> FilterStage<M> {
    pub fn new(source: M) -> Self {
        Self {
            source,
            filters: BTreeMap::new(),
            revision: 0,
            visible: RefCell::new(None),
        }
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut M {
        &mut self.source
    }

    pub fn set_text_filter(&mut self, column: ColumnKey, pattern: &str) {
        if pattern.trim().is_empty() {
            self.filters.remove(&column);
        } else {
            self.filters.insert(column, ColumnFilter::text(pattern));
        }
        self.invalidate();
    }

    pub fn set_range_filter(&mut self, column: ColumnKey, min: Option<i64>, max: Option<i64>) {
        if min.is_none() && max.is_none() {
            self.filters.remove(&column);
        } else {
            self.filters.insert(column, ColumnFilter::Range { min, max });
        }
        self.invalidate();
    }

    pub fn apply(&mut self, arg: &ColumnFilterArg) {
        match &arg.filter {
            ColumnFilter::Text { pattern } => self.set_text_filter(arg.column, pattern),
            ColumnFilter::Range { min, max } => self.set_range_filter(arg.column, *min, *max),
        }
    }

    pub fn clear(&mut self) {
        if !self.filters.is_empty() {
            self.filters.clear();
            self.invalidate();
        }
    }

    pub fn filter_for(&self, column: ColumnKey) -> Option<&ColumnFilter> {
        self.filters.get(&column)
    }

    pub fn active_columns(&self) -> Vec<ColumnKey> {
        self.filters.keys().copied().collect()
    }

    pub fn filters(&self) -> &BTreeMap<ColumnKey, ColumnFilter> {
        &self.filters
    }

    /// Row index in this stage for a given source row, if it passes.
    pub fn position_of_source(&self, source_row: usize) -> Option<usize> {
        self.visible_rows().binary_search(&source_row).ok()
    }

    fn invalidate(&mut self) {
        self.revision += 1;
        self.visible.get_mut().take();
    }

    fn visible_rows(&self) -> Ref<'_, Vec<usize>> {
        let generation = self.source.generation();
        let stale = !matches!(&*self.visible.borrow(), Some((cached, _)) if *cached == generation);
        if stale {
            let rows = self.compute_visible();
            *self.visible.borrow_mut() = Some((generation, rows));
        }
        Ref::map(self.visible.borrow(), |cached| {
            cached.as_ref().map(|(_, rows)| rows).unwrap_or(&NO_ROWS)
        })
    }

    fn compute_visible(&self) -> Vec<usize> {
        let predicates: Vec<(usize, &ColumnFilter)> = self
            .filters
            .iter()
            .filter_map(|(key, filter)| {
                let column = (0..self.source.column_count())
                    .find(|&column| self.source.column_key(column) == Some(*key));
                if column.is_none() {
                    tracing::debug!(column = %key, "filter column not present, ignoring");
                }
                column.map(|column| (column, filter))
            })
            .collect();

        (0..self.source.row_count())
            .filter(|&row| {
                predicates.iter().all(|(column, filter)| {
                    let value = self.source.cell_value(row, *column).unwrap_or_default();
                    filter.matches(&value)
                })
            })
            .collect()
    }
}

impl<M: TableModel> TableModel for FilterStage<M> {
    fn row_count(&self) -> usize {
        self.visible_rows().len()
    }

    fn column_count(&self) -> usize {
        self.source.column_count()
    }

    fn cell_value(&self, row: usize, column: usize) -> Option<String> {
        let source_row = self.visible_rows().get(row).copied()?;
        self.source.cell_value(source_row, column)
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
        let source_row = self.visible_rows().get(row).copied()?;
        self.source.map_to_source(source_row)
    }
}
