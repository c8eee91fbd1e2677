use assert_matches::assert_matches;

use sample_listing::domain::{ColumnKey, RowKey, SampleRow, TileLink, normalize_sample_name};
use sample_listing::error::ListingError;

#[test]
fn parse_row_key() {
    let key: RowKey = " g1/s1 ".parse().unwrap();
    assert_eq!(key, RowKey::new("g1", "s1"));
    assert_eq!(key.to_string(), "g1/s1");
    assert!(!key.is_placeholder());
}

#[test]
fn parse_placeholder_row_key() {
    let key: RowKey = "g1/".parse().unwrap();
    assert!(key.is_placeholder());
}

#[test]
fn parse_row_key_invalid() {
    assert_matches!("g1".parse::<RowKey>(), Err(ListingError::InvalidRowKey(_)));
    assert_matches!("/s1".parse::<RowKey>(), Err(ListingError::InvalidRowKey(_)));
}

#[test]
fn parse_column_key_case_insensitive() {
    let key: ColumnKey = "Sample_Name".parse().unwrap();
    assert_eq!(key, ColumnKey::SampleName);
    assert_matches!("nope".parse::<ColumnKey>(), Err(ListingError::UnknownColumn(_)));
}

#[test]
fn normalized_names_ignore_case_space_and_punctuation() {
    assert_eq!(normalize_sample_name(" Ti-6Al 4V "), "ti6al4v");
    assert_eq!(normalize_sample_name("a_b/c.d"), "abcd");
}

#[test]
fn links_keep_aligned_lists_and_counts() {
    let mut row = SampleRow {
        subgroup_id: "g1".to_string(),
        sample_id: "s1".to_string(),
        grant_numbers: vec!["FALLBACK".to_string()],
        ..SampleRow::default()
    };
    row.set_links(vec![
        TileLink::new("e1", "tile A", "d1", "Tensile", vec!["G2".to_string(), "G1".to_string()]),
        TileLink::new("e2", "tile B", "d1", "Tensile", vec!["G1".to_string()]),
        TileLink::new("e3", "tile C", "d2", "XRD", Vec::new()),
    ]);

    assert!(row.is_aligned());
    assert_eq!(row.data_entry_count, 3);
    assert_eq!(row.dataset_count, 2);
    assert_eq!(row.grant_numbers, vec!["G1", "G2"]);
    assert_eq!(row.grant_count, 2);
    assert_eq!(
        row.cell(ColumnKey::TileDatasetGrant),
        "tile A - Tensile - G2 / G1\ntile B - Tensile - G1\ntile C - XRD"
    );
    assert_eq!(row.cell(ColumnKey::DatasetIds), "d1\nd1\nd2");
}

#[test]
fn grants_fall_back_to_row_grants_without_links() {
    let mut row = SampleRow {
        grant_numbers: vec!["B".to_string(), " ".to_string(), "A".to_string(), "B".to_string()],
        ..SampleRow::default()
    };
    row.recompute_counts();
    assert_eq!(row.grant_numbers, vec!["A", "B"]);
    assert_eq!(row.grant_count, 2);
}

#[test]
fn tile_links_build_page_urls() {
    let link = TileLink::new("e1", "tile A", "d1", "Tensile", Vec::new());
    assert!(link.tile_url.ends_with("/data/e1"));
    assert!(link.dataset_url.ends_with("/datasets/d1"));
    let blank = TileLink::new("", "", "", "", Vec::new());
    assert!(blank.tile_url.is_empty());
    assert!(blank.dataset_url.is_empty());
}
