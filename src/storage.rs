use crate::models::{FetchResult, Observation};
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::borrow::Cow;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Neutralise cells a spreadsheet would evaluate as a formula. Numbers stay as they are.
fn safe_cell(cell: &str) -> Cow<'_, str> {
    let risky = cell
        .chars()
        .next()
        .is_some_and(|c| matches!(c, '=' | '+' | '-' | '@' | '\t' | '\r'));
    if risky && cell.trim().parse::<f64>().is_err() {
        Cow::Owned(format!("'{cell}"))
    } else {
        Cow::Borrowed(cell)
    }
}

/// Save the rows of a fetch as CSV, with the server's header row.
pub fn save_csv<P: AsRef<Path>>(result: &FetchResult, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut wtr = WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("create {}", path.display()))?;
    wtr.write_record(result.headers.iter().map(|h| safe_cell(h).into_owned()))?;
    for row in &result.rows {
        wtr.write_record(row.iter().map(|c| safe_cell(c).into_owned()))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Save observations as pretty JSON array.
pub fn save_json<P: AsRef<Path>>(observations: &[Observation], path: P) -> Result<()> {
    let path = path.as_ref();
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let s = serde_json::to_string_pretty(observations)?;
    f.write_all(s.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryKey;
    use tempfile::tempdir;

    #[test]
    fn write_csv_and_json() {
        let dir = tempdir().unwrap();
        let csvp = dir.path().join("x.csv");
        let jsonp = dir.path().join("x.json");
        let result = FetchResult {
            indicator: Some("CME_MRY0T4".parse().unwrap()),
            dataflow_used: "CME".parse().unwrap(),
            key: QueryKey::new(".CME_MRY0T4._T"),
            headers: vec!["REF_AREA".into(), "TIME_PERIOD".into(), "OBS_VALUE".into()],
            rows: vec![vec!["AFG".into(), "2020".into(), "58.5".into()]],
            pages: 1,
            attempts: Vec::new(),
        };
        save_csv(&result, &csvp).unwrap();
        save_json(&result.observations(), &jsonp).unwrap();
        assert!(csvp.exists());
        assert!(jsonp.exists());
    }

    #[test]
    fn formulas_are_quoted_numbers_are_not() {
        assert_eq!(safe_cell("=1+1"), "'=1+1");
        assert_eq!(safe_cell("@foo"), "'@foo");
        assert_eq!(safe_cell("-12.5"), "-12.5");
        assert_eq!(safe_cell("+3"), "+3");
        assert_eq!(safe_cell("AFG"), "AFG");
    }
}
