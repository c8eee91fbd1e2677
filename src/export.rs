use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;

use crate::error::ListingError;
use crate::store::write_bytes_atomic;
use crate::view::ListingView;

/// Spreadsheet applications detect UTF-8 through this marker.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// `sample_listing_<timestamp>.csv` in the working directory.
pub fn default_export_path() -> Utf8PathBuf {
    Utf8PathBuf::from(format!("sample_listing_{}.csv", Local::now().format("%Y%m%d_%H%M%S")))
}

/// Writes a header of visible column labels and one record per filtered
/// row. Paging is ignored. Returns the number of records written.
pub fn write_csv<W: Write>(view: &ListingView, out: W) -> Result<usize, ListingError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(view.visible_labels()).map_err(csv_error)?;
    let mut written = 0;
    for row in view.filtered_rows() {
        writer
            .write_record(view.visible_columns().iter().map(|key| row.cell(*key)))
            .map_err(csv_error)?;
        written += 1;
    }
    writer
        .flush()
        .map_err(|err| ListingError::Export(err.to_string()))?;
    Ok(written)
}

/// Exports the filtered listing to `path` atomically.
pub fn export_csv(view: &ListingView, path: &Utf8Path) -> Result<usize, ListingError> {
    let mut content = UTF8_BOM.to_vec();
    let written = write_csv(view, &mut content)?;
    if written == 0 {
        return Err(ListingError::Export("no rows to export".to_string()));
    }
    write_bytes_atomic(path, &content)?;
    tracing::info!(%path, rows = written, "exported sample listing");
    Ok(written)
}

fn csv_error(err: csv::Error) -> ListingError {
    ListingError::Export(err.to_string())
}
