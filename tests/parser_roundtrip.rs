use unicef_sdmx::parser::{Node, parse};

fn catalog(n: usize) -> String {
    let mut text = String::from("_metadata:\n  synced_at: '2025-06-01T00:00:00Z'\nindicators:\n");
    for i in 0..n {
        text.push_str(&format!(
            "  IND_{i:04}:\n    name: Indicator number {i}\n    dataflows:\n      - FLOW_{}\n      - GLOBAL_DATAFLOW\n    tier: {}\n",
            i % 7,
            i % 3
        ));
    }
    text
}

#[test]
fn many_indicators_parse_with_their_dataflows() {
    let n = 250;
    let doc = parse(&catalog(n)).unwrap();
    let indicators = doc.get("indicators").and_then(Node::as_map).unwrap();
    assert_eq!(indicators.len(), n);
    for i in [0, 1, 117, n - 1] {
        let entry = indicators.get(&format!("IND_{i:04}")).unwrap();
        let flows = entry.get("dataflows").unwrap().as_str_list();
        assert_eq!(flows, vec![format!("FLOW_{}", i % 7).as_str(), "GLOBAL_DATAFLOW"]);
        assert_eq!(entry.get("tier").and_then(Node::as_i64), Some((i % 3) as i64));
    }
    // document order is preserved
    let keys: Vec<&str> = indicators.keys().take(3).collect();
    assert_eq!(keys, vec!["IND_0000", "IND_0001", "IND_0002"]);
}

#[test]
fn duplicate_keys_keep_the_last_value() {
    let text = "\
indicators:
  CME_MRY0T4:
    dataflows: [CME]
  NT_ANT_HAZ_NE2:
    dataflows: [NUTRITION]
  CME_MRY0T4:
    dataflows: [CME_DF_2021_WQ]
";
    let doc = parse(text).unwrap();
    let indicators = doc.get("indicators").and_then(Node::as_map).unwrap();
    assert_eq!(indicators.len(), 2);
    let flows = indicators.get("CME_MRY0T4").unwrap().get("dataflows").unwrap();
    assert_eq!(flows.as_str_list(), vec!["CME_DF_2021_WQ"]);
}

#[test]
fn rendering_parses_back_to_the_same_tree() {
    let text = "\
_metadata:
  source: 'UNICEF: SDMX warehouse'
indicators:
  WS_PPL_W-SM:
    name: Proportion of population using safely managed drinking water services
    dataflows:
      - WASH_HOUSEHOLDS
      - GLOBAL_DATAFLOW
    disaggregations_with_totals: [RESIDENCE, WEALTH_QUINTILE]
    description: ~
";
    let doc = parse(text).unwrap();
    let again = parse(&doc.to_string()).unwrap();
    assert_eq!(doc, again);
    assert_eq!(
        again.root().path(&["_metadata", "source"]).and_then(Node::as_str),
        Some("UNICEF: SDMX warehouse")
    );
}

#[test]
fn malformed_input_reports_line_numbers() {
    let cases: &[(&str, usize)] = &[
        ("a: 1\n\tb: 2\n", 2),
        ("a:\n  b: 1\n c: 2\n", 3),
    ];
    for (text, line) in cases {
        let err = parse(text).unwrap_err();
        assert_eq!(err.line, *line, "parsing {text:?}");
    }
}
