use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SdmxError;
use crate::fetch::Attempt;

/// Dimension ids that are always present and never user-filterable.
pub const FIXED_DIMENSIONS: [&str; 4] = ["REF_AREA", "INDICATOR", "TIME_PERIOD", "UNIT_MEASURE"];

/// Reserved code for the aggregate ("totals") category of a dimension.
pub const TOTAL: &str = "_T";

fn is_code_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-')
}

/// Short indicator code such as `CME_MRY0T4`. Always upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndicatorCode(String);

impl IndicatorCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Indicator family: the text before the first underscore.
    pub fn prefix(&self) -> &str {
        self.0.split('_').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for IndicatorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IndicatorCode {
    type Err = SdmxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        if normalized.is_empty() || !normalized.chars().all(is_code_char) {
            return Err(SdmxError::InvalidIndicatorCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for IndicatorCode {
    type Error = SdmxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IndicatorCode> for String {
    fn from(code: IndicatorCode) -> Self {
        code.0
    }
}

/// Name of one dataset in the warehouse, e.g. `CME` or `GLOBAL_DATAFLOW`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataflowId(String);

impl DataflowId {
    /// For compile-time constants that are known to be well formed.
    pub(crate) fn from_static(id: &'static str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DataflowId {
    type Err = SdmxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        if normalized.is_empty() || !normalized.chars().all(is_code_char) {
            return Err(SdmxError::InvalidDataflowId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for DataflowId {
    type Error = SdmxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataflowId> for String {
    fn from(id: DataflowId) -> Self {
        id.0
    }
}

impl PartialEq<&str> for DataflowId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One axis of a dataflow's cube and its place in the key syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDescriptor {
    pub id: String,
    pub position: u32,
}

impl DimensionDescriptor {
    pub fn is_fixed(&self) -> bool {
        FIXED_DIMENSIONS.contains(&self.id.as_str())
    }

    pub fn is_filter_eligible(&self) -> bool {
        !self.is_fixed()
    }
}

/// Where a fallback sequence came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceSource {
    Metadata,
    PrefixTable { prefix: String },
    UniversalDefault,
    Override,
}

/// Ordered candidate dataflows for one indicator, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSequence {
    pub indicator: IndicatorCode,
    pub dataflows: Vec<DataflowId>,
    pub source: SequenceSource,
}

impl FallbackSequence {
    pub fn first(&self) -> Option<&DataflowId> {
        self.dataflows.first()
    }

    pub fn last(&self) -> Option<&DataflowId> {
        self.dataflows.last()
    }

    pub fn len(&self) -> usize {
        self.dataflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataflows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataflowId> {
        self.dataflows.iter()
    }
}

/// Positional, dot-delimited selector for a dataflow's cube.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(String);

impl QueryKey {
    pub const ALL: &'static str = "all";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Whole-dataflow export token.
    pub fn all() -> Self {
        Self(Self::ALL.to_string())
    }

    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> Vec<&str> {
        self.0.split('.').collect()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive year bounds for `startPeriod` / `endPeriod`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn year(year: i32) -> Self {
        Self::new(year, year)
    }

    /// Query parameters understood by the SDMX REST API.
    pub fn to_query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("startPeriod", start.to_string()));
        }
        if let Some(end) = self.end {
            params.push(("endPeriod", end.to_string()));
        }
        params
    }
}

impl FromStr for YearRange {
    type Err = SdmxError;

    /// Accepts `YYYY`, `YYYY:YYYY`, `YYYY:` and `:YYYY`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bad = || SdmxError::Config(format!("invalid year range {value:?}"));
        let parse_part = |part: &str| -> Result<Option<i32>, SdmxError> {
            let part = part.trim();
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse::<i32>().map(Some).map_err(|_| bad())
            }
        };
        let range = match value.split_once(':') {
            Some((a, b)) => Self {
                start: parse_part(a)?,
                end: parse_part(b)?,
            },
            None => {
                let year = parse_part(value)?.ok_or_else(bad)?;
                Self::year(year)
            }
        };
        if let (Some(start), Some(end)) = (range.start, range.end)
            && start > end
        {
            return Err(bad());
        }
        Ok(range)
    }
}

/// One HTTP response page of delimited rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPage {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FetchPage {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rows of the attempt that satisfied a request, plus the attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub indicator: Option<IndicatorCode>,
    pub dataflow_used: DataflowId,
    pub key: QueryKey,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub pages: usize,
    pub attempts: Vec<Attempt>,
}

impl FetchResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Dataflows attempted, in attempt order.
    pub fn tried(&self) -> Vec<&DataflowId> {
        self.attempts.iter().map(|a| &a.dataflow).collect()
    }

    /// Position of a column, matching either `ID` or `ID:Label` headers.
    pub fn column(&self, id: &str) -> Option<usize> {
        column_index(&self.headers, id)
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.rows
            .iter()
            .map(|row| Observation::from_row(&self.headers, row))
            .collect()
    }
}

fn column_index(headers: &[String], id: &str) -> Option<usize> {
    headers.iter().position(|h| {
        h == id
            || h.split_once(':')
                .map(|(code, _)| code.trim() == id)
                .unwrap_or(false)
    })
}

/// `AFG: Afghanistan` (labels=both) -> `AFG`.
fn code_of(cell: &str) -> &str {
    match cell.split_once(": ") {
        Some((code, _)) => code.trim(),
        None => cell.trim(),
    }
}

/// Tidy observation (one row = one value for one area, indicator and period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub dataflow: Option<String>,
    pub ref_area: String,
    pub indicator: String,
    pub time_period: String,
    pub year: Option<i32>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub obs_status: Option<String>,
    /// Every other column, keyed by dimension/attribute id.
    pub extra: BTreeMap<String, String>,
}

impl Observation {
    pub fn from_row(headers: &[String], row: &[String]) -> Self {
        let cell = |id: &str| -> Option<&str> {
            column_index(headers, id)
                .and_then(|i| row.get(i))
                .map(|s| s.as_str())
                .filter(|s| !s.trim().is_empty())
        };
        let time_period = cell("TIME_PERIOD").map(code_of).unwrap_or("").to_string();
        let year = time_period
            .get(..4)
            .and_then(|y| y.parse::<i32>().ok());
        let known = [
            "DATAFLOW",
            "REF_AREA",
            "INDICATOR",
            "TIME_PERIOD",
            "OBS_VALUE",
            "UNIT_MEASURE",
            "OBS_STATUS",
        ];
        let mut extra = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            let id = header.split_once(':').map(|(c, _)| c.trim()).unwrap_or(header);
            if known.contains(&id) {
                continue;
            }
            if let Some(value) = row.get(i).filter(|v| !v.is_empty()) {
                extra.insert(id.to_string(), code_of(value).to_string());
            }
        }
        Self {
            dataflow: cell("DATAFLOW").map(|s| s.trim().to_string()),
            ref_area: cell("REF_AREA").map(code_of).unwrap_or("").to_string(),
            indicator: cell("INDICATOR").map(code_of).unwrap_or("").to_string(),
            time_period,
            year,
            value: cell("OBS_VALUE").and_then(|v| v.trim().parse::<f64>().ok()),
            unit: cell("UNIT_MEASURE").map(|s| code_of(s).to_string()),
            obs_status: cell("OBS_STATUS").map(|s| code_of(s).to_string()),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_prefix() {
        let code: IndicatorCode = " cme_mry0t4 ".parse().unwrap();
        assert_eq!(code.as_str(), "CME_MRY0T4");
        assert_eq!(code.prefix(), "CME");
        let bare: IndicatorCode = "STUNTING".parse().unwrap();
        assert_eq!(bare.prefix(), "STUNTING");
    }

    #[test]
    fn indicator_rejects_garbage() {
        assert!("".parse::<IndicatorCode>().is_err());
        assert!("CME MRY".parse::<IndicatorCode>().is_err());
    }

    #[test]
    fn year_range_forms() {
        assert_eq!("2020".parse::<YearRange>().unwrap(), YearRange::year(2020));
        assert_eq!(
            "2010:2020".parse::<YearRange>().unwrap(),
            YearRange::new(2010, 2020)
        );
        let open: YearRange = "2015:".parse().unwrap();
        assert_eq!(open.start, Some(2015));
        assert_eq!(open.end, None);
        assert!("2020:2010".parse::<YearRange>().is_err());
    }
}
