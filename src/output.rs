use std::io::{self, Write};

use serde::Serialize;

use crate::listing::{LoadReport, ProgressEvent, ProgressSink, PurgeReport, RefreshDecision};
use crate::remote::FetchReport;
use crate::view::PageSnapshot;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Result of `show`: what was loaded plus the visible page.
#[derive(Debug, Clone, Serialize)]
pub struct ShowResult {
    pub load: LoadReport,
    pub missing: Vec<String>,
    pub page: PageSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub load: LoadReport,
    pub rows: usize,
    pub missing: Vec<String>,
    pub cache_error: Option<String>,
}

/// Result of `export`: where the CSV went and how many rows it holds.
#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub load: LoadReport,
    pub path: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchMissingResult {
    pub decision: RefreshDecision,
    pub report: FetchReport,
    pub rows: usize,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_refresh(result: &RefreshResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchMissingResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_purge(result: &PurgeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress goes to the log in non-interactive mode; stdout stays JSON.
impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}

/// Plain-text rendering of one page for interactive `show`.
pub fn render_page(page: &PageSnapshot) -> String {
    let mut widths: Vec<usize> = page.columns.iter().map(|column| column.label.chars().count()).collect();
    for row in &page.rows {
        for (index, cell) in row.cells.iter().enumerate() {
            if let Some(width) = widths.get_mut(index) {
                *width = (*width).max(first_line(cell).chars().count().min(MAX_CELL_WIDTH));
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = page
        .columns
        .iter()
        .zip(&widths)
        .map(|(column, width)| pad(&column.label, *width))
        .collect();
    out.push_str(header.join("  ").trim_end());
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    out.push_str(&rule.join("  "));
    out.push('\n');

    for row in &page.rows {
        let cells: Vec<String> = row
            .cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| pad(first_line(cell), *width))
            .collect();
        let line = cells.join("  ");
        out.push_str(line.trim_end());
        if row.missing_sample {
            out.push_str("  (missing)");
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "page {}/{}  rows {} of {}",
        page.page, page.total_pages, page.total_rows, page.source_rows
    ));
    if !page.filters.is_empty() {
        out.push_str(&format!("  filters: {}", page.filters.join(", ")));
    }
    out.push('\n');
    out
}

const MAX_CELL_WIDTH: usize = 40;

fn first_line(cell: &str) -> &str {
    cell.lines().next().unwrap_or("")
}

fn pad(value: &str, width: usize) -> String {
    let mut clipped: String = value.chars().take(width).collect();
    if value.chars().count() > width && width > 0 {
        clipped.pop();
        clipped.push('…');
    }
    format!("{clipped:<width$}")
}
