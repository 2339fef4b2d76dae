use std::fs;
use std::path::Path;
use tempfile::{TempDir, tempdir};
use unicef_sdmx::SdmxError;
use unicef_sdmx::metadata::MetadataStore;
use unicef_sdmx::models::{DataflowId, IndicatorCode};
use unicef_sdmx::query_key::{Filters, KeyMode, KeyWarning, SchemaKeyBuilder};

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn fixture() -> TempDir {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "dataflows/WASH_HOUSEHOLDS.yaml",
        "\
id: WASH_HOUSEHOLDS
dimensions:
  - id: REF_AREA
    position: 1
  - id: INDICATOR
    position: 2
  - id: SERVICE_TYPE
    position: 3
  - id: WEALTH_QUINTILE
    position: 4
  - id: RESIDENCE
    position: 5
",
    );
    // same dimensions, different order
    write(
        dir.path(),
        "dataflows/EDUCATION.yaml",
        "dimensions: [REF_AREA, INDICATOR, AGE, SEX, TIME_PERIOD]\n",
    );
    write(
        dir.path(),
        "dataflows/NUTRITION.yaml",
        "dimensions: [REF_AREA, INDICATOR, SEX, AGE, TIME_PERIOD]\n",
    );
    dir
}

fn code(s: &str) -> IndicatorCode {
    s.parse().unwrap()
}

fn flow(s: &str) -> DataflowId {
    s.parse().unwrap()
}

#[test]
fn user_filter_fills_only_its_own_position() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    let filters = Filters::new().residence("U").unwrap();
    let built = builder
        .build(&code("WS_PPL_W-SM"), &flow("WASH_HOUSEHOLDS"), &filters, KeyMode::UserFilters)
        .unwrap();
    assert_eq!(built.key.as_str(), ".WS_PPL_W-SM...U");
    assert_eq!(built.key.segments(), vec!["", "WS_PPL_W-SM", "", "", "U"]);
    assert_eq!(built.layout, vec!["SERVICE_TYPE", "WEALTH_QUINTILE", "RESIDENCE"]);
    assert!(built.warnings.is_empty());
    assert!(built.schema_known());
}

#[test]
fn totals_and_all_disaggregations() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    let none = Filters::new();
    let totals = builder
        .build(&code("WS_PPL_W-SM"), &flow("WASH_HOUSEHOLDS"), &none, KeyMode::Totals)
        .unwrap();
    assert_eq!(totals.key.as_str(), ".WS_PPL_W-SM._T._T._T");

    let all = builder
        .build(&code("WS_PPL_W-SM"), &flow("WASH_HOUSEHOLDS"), &none, KeyMode::AllDisaggregations)
        .unwrap();
    assert_eq!(all.key.as_str(), ".WS_PPL_W-SM...");
    assert!(all.key.segments()[2..].iter().all(|s| s.is_empty()));
}

#[test]
fn segment_count_matches_filter_eligible_dimensions() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    for (name, eligible) in [("WASH_HOUSEHOLDS", 3), ("EDUCATION", 2), ("NUTRITION", 2)] {
        let built = builder
            .build(&code("X_Y"), &flow(name), &Filters::new(), KeyMode::Totals)
            .unwrap();
        // leading empty segment, indicator, then one per eligible dimension
        assert_eq!(built.key.segments().len(), 2 + eligible, "{name}");
    }
}

#[test]
fn same_filters_land_in_each_dataflows_own_positions() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    let filters = Filters::new().sex("F").unwrap().age("Y15T19").unwrap();
    let ed = builder
        .build(&code("ED_CR_L1"), &flow("EDUCATION"), &filters, KeyMode::UserFilters)
        .unwrap();
    let nt = builder
        .build(&code("ED_CR_L1"), &flow("NUTRITION"), &filters, KeyMode::UserFilters)
        .unwrap();
    assert_eq!(ed.key.as_str(), ".ED_CR_L1.Y15T19.F");
    assert_eq!(nt.key.as_str(), ".ED_CR_L1.F.Y15T19");
}

#[test]
fn missing_schema_uses_conservative_layout_with_warning() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    let built = builder
        .build(&code("CME_MRY0T4"), &flow("CME"), &Filters::new(), KeyMode::Totals)
        .unwrap();
    assert_eq!(built.key.as_str(), ".CME_MRY0T4._T");
    assert!(!built.schema_known());
    assert!(matches!(
        &built.warnings[..],
        [KeyWarning::SchemaUnavailable { dataflow, .. }] if dataflow.as_str() == "CME"
    ));
}

#[test]
fn filter_on_absent_dimension_is_reported_separately() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let builder = SchemaKeyBuilder::new(&store);
    let filters = Filters::new()
        .residence("R")
        .unwrap()
        .maternal_education("ISCED11_1")
        .unwrap();
    let built = builder
        .build(&code("WS_PPL_W-SM"), &flow("WASH_HOUSEHOLDS"), &filters, KeyMode::UserFilters)
        .unwrap();
    assert_eq!(built.key.as_str(), ".WS_PPL_W-SM...R");
    assert!(built.schema_known());
    assert_eq!(
        built.warnings,
        vec![KeyWarning::UnsupportedFilter {
            dataflow: flow("WASH_HOUSEHOLDS"),
            dimension: "MATERNAL_EDU_LVL".into(),
        }]
    );
}

#[test]
fn multiple_codes_join_with_plus() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let filters = Filters::new().wealth_quintile("Q1+Q5").unwrap();
    let built = SchemaKeyBuilder::new(&store)
        .build(&code("WS_PPL_W-SM"), &flow("WASH_HOUSEHOLDS"), &filters, KeyMode::UserFilters)
        .unwrap();
    assert_eq!(built.key.as_str(), ".WS_PPL_W-SM..Q1+Q5.");
}

#[test]
fn bulk_key_is_all() {
    let dir = fixture();
    let store = MetadataStore::new(dir.path());
    let built = SchemaKeyBuilder::new(&store).build_bulk();
    assert_eq!(built.key.as_str(), "all");
    assert!(built.key.is_all());
}

#[test]
fn malformed_schema_propagates() {
    let dir = fixture();
    write(dir.path(), "dataflows/BROKEN.yaml", "name: no dimensions here\n");
    let store = MetadataStore::new(dir.path());
    let err = SchemaKeyBuilder::new(&store)
        .build(&code("X_Y"), &flow("BROKEN"), &Filters::new(), KeyMode::Totals)
        .unwrap_err();
    assert!(matches!(err, SdmxError::MalformedMetadata { .. }), "{err}");
}
