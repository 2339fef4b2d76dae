use unicef_sdmx::client::{HttpTransport, PageRequest, TransportError, parse_csv_page};
use unicef_sdmx::config::{LabelMode, Settings};
use unicef_sdmx::models::{QueryKey, YearRange};

fn request(key: &str, years: Option<YearRange>, start_index: usize) -> PageRequest {
    PageRequest {
        agency: "UNICEF".into(),
        dataflow: "WASH_HOUSEHOLDS".parse().unwrap(),
        version: "1.0".into(),
        key: QueryKey::new(key),
        years,
        start_index,
        count: 100_000,
    }
}

#[test]
fn page_url_layout() {
    let settings = Settings {
        base_url: "https://example.org/rest/".into(),
        ..Settings::default()
    };
    let transport = HttpTransport::new(&settings).unwrap();
    let url = transport.page_url(&request(".WS_PPL_W-SM..Q1+Q5.U", Some(YearRange::new(2015, 2022)), 200_000));
    assert_eq!(
        url,
        "https://example.org/rest/data/UNICEF,WASH_HOUSEHOLDS,1.0/.WS_PPL_W-SM..Q1+Q5.U\
         ?format=csv&labels=id&startPeriod=2015&endPeriod=2022&startIndex=200000&count=100000"
    );
}

#[test]
fn page_url_escapes_unsafe_characters_and_labels() {
    let settings = Settings {
        labels: LabelMode::Both,
        ..Settings::default()
    };
    let transport = HttpTransport::new(&settings).unwrap();
    let url = transport.page_url(&request("all", None, 0));
    assert!(url.starts_with("https://sdmx.data.unicef.org/ws/public/sdmxapi/rest/data/"));
    assert!(url.contains("/all?format=csv&labels=both&startIndex=0&count=100000"));
    assert!(!url.contains("startPeriod"));

    let mut odd = request(".A B/C", None, 0);
    odd.agency = "UNICEF SDG".into();
    let url = transport.page_url(&odd);
    assert!(url.contains("/data/UNICEF%20SDG,WASH_HOUSEHOLDS,1.0/.A%20B%2FC?"));
}

#[test]
fn csv_page_with_quoted_labels() {
    let body = "\
DATAFLOW,REF_AREA:Geographic area,INDICATOR:Indicator,TIME_PERIOD:Time period,OBS_VALUE:Observation Value
UNICEF:CME(1.0),AFG: Afghanistan,\"CME_MRY0T4: Under-five mortality rate, per 1000\",2020,58.5
UNICEF:CME(1.0),ALB: Albania,\"CME_MRY0T4: Under-five mortality rate, per 1000\",2020,9.7
";
    let page = parse_csv_page(body).unwrap();
    assert_eq!(page.headers.len(), 5);
    assert_eq!(page.headers[1], "REF_AREA:Geographic area");
    assert_eq!(page.len(), 2);
    assert_eq!(page.rows[1][1], "ALB: Albania");
    assert_eq!(page.rows[0][2], "CME_MRY0T4: Under-five mortality rate, per 1000");
}

#[test]
fn empty_body_and_header_only_are_empty_pages() {
    assert!(parse_csv_page("").unwrap().is_empty());
    let header_only = parse_csv_page("DATAFLOW,REF_AREA,OBS_VALUE\n").unwrap();
    assert!(header_only.is_empty());
    assert_eq!(header_only.headers, vec!["DATAFLOW", "REF_AREA", "OBS_VALUE"]);
}

#[test]
fn ragged_csv_is_a_decode_error() {
    let err = parse_csv_page("A,B\n1,2,3\n").unwrap_err();
    assert!(matches!(err, TransportError::Decode { .. }));
}
