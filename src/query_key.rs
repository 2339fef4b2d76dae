//! Positional query keys built from a dataflow's own dimension order.
//!
//! Dataflows disagree on where `SEX`, `AGE` and the other disaggregations sit in the key, so
//! a key is laid out from the schema rather than from a fixed template:
//!
//! ```text
//! WASH_HOUSEHOLDS: REF_AREA@1 INDICATOR@2 SERVICE_TYPE@3 WEALTH_QUINTILE@4 RESIDENCE@5
//! RESIDENCE=U  ->  .WS_PPL_W-SM...U
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::SdmxError;
use crate::metadata::MetadataStore;
use crate::models::{DataflowId, IndicatorCode, QueryKey, FIXED_DIMENSIONS, TOTAL};

/// Layout used when a dataflow's schema is not available: the universal dataflow's
/// single disaggregation.
pub const CONSERVATIVE_LAYOUT: [&str; 1] = ["SEX"];

/// How filter-eligible dimensions are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyMode {
    /// `_T` everywhere: aggregate values only.
    Totals,
    /// Empty segments everywhere: every disaggregation (much larger responses).
    AllDisaggregations,
    /// Caller's value where given, empty otherwise.
    UserFilters,
}

/// Sparse per-dimension filter values, keyed by upper-case dimension id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filters(BTreeMap<String, String>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `dimension` to `value`; multiple codes may be joined with `+`.
    pub fn set(&mut self, dimension: &str, value: impl Into<String>) -> Result<&mut Self, SdmxError> {
        let dimension = dimension.trim().to_ascii_uppercase();
        if dimension.is_empty() {
            return Err(SdmxError::InvalidFilter("empty dimension id".to_string()));
        }
        if FIXED_DIMENSIONS.contains(&dimension.as_str()) {
            return Err(SdmxError::InvalidFilter(format!(
                "{dimension} is not filterable"
            )));
        }
        let value = value.into().trim().to_string();
        if value.contains('.') {
            return Err(SdmxError::InvalidFilter(format!(
                "value {value:?} for {dimension} contains a key separator"
            )));
        }
        self.0.insert(dimension, value);
        Ok(self)
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, dimension: &str, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.set(dimension, value)?;
        Ok(self)
    }

    pub fn sex(self, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.with("SEX", value)
    }

    pub fn age(self, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.with("AGE", value)
    }

    pub fn wealth_quintile(self, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.with("WEALTH_QUINTILE", value)
    }

    pub fn residence(self, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.with("RESIDENCE", value)
    }

    pub fn maternal_education(self, value: impl Into<String>) -> Result<Self, SdmxError> {
        self.with("MATERNAL_EDU_LVL", value)
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.0.get(dimension).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Non-fatal problems found while building a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KeyWarning {
    /// No schema for the dataflow; the conservative layout was used.
    SchemaUnavailable { dataflow: DataflowId, reason: String },
    /// The dataflow has no such dimension, so the filter was not applied.
    UnsupportedFilter { dataflow: DataflowId, dimension: String },
}

impl fmt::Display for KeyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyWarning::SchemaUnavailable { dataflow, reason } => write!(
                f,
                "no schema for {dataflow} ({reason}); using a {}-dimension key",
                CONSERVATIVE_LAYOUT.len()
            ),
            KeyWarning::UnsupportedFilter {
                dataflow,
                dimension,
            } => write!(f, "filter on {dimension} is not supported by {dataflow}"),
        }
    }
}

/// A key plus whatever had to be approximated to build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltKey {
    pub key: QueryKey,
    /// Filter-eligible dimension ids in key order.
    pub layout: Vec<String>,
    pub warnings: Vec<KeyWarning>,
}

impl BuiltKey {
    pub fn schema_known(&self) -> bool {
        !self
            .warnings
            .iter()
            .any(|w| matches!(w, KeyWarning::SchemaUnavailable { .. }))
    }
}

/// Builds keys from the dimension lists held by a [`MetadataStore`].
#[derive(Debug, Clone, Copy)]
pub struct SchemaKeyBuilder<'a> {
    store: &'a MetadataStore,
}

impl<'a> SchemaKeyBuilder<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Key selecting `indicator` in `dataflow`.
    pub fn build(
        &self,
        indicator: &IndicatorCode,
        dataflow: &DataflowId,
        filters: &Filters,
        mode: KeyMode,
    ) -> Result<BuiltKey, SdmxError> {
        let mut warnings = Vec::new();
        let layout: Vec<String> = match self.store.get_dimensions(dataflow) {
            Ok(dims) => dims
                .iter()
                .filter(|d| d.is_filter_eligible())
                .map(|d| d.id.clone())
                .collect(),
            Err(err) if err.is_metadata_unavailable() => {
                let reason = match &err {
                    SdmxError::MetadataUnavailable { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warnings.push(KeyWarning::SchemaUnavailable {
                    dataflow: dataflow.clone(),
                    reason,
                });
                CONSERVATIVE_LAYOUT.iter().map(|d| d.to_string()).collect()
            }
            Err(err) => return Err(err),
        };

        if mode == KeyMode::UserFilters {
            for (dimension, _) in filters.iter() {
                if !layout.iter().any(|d| d == dimension) {
                    warnings.push(KeyWarning::UnsupportedFilter {
                        dataflow: dataflow.clone(),
                        dimension: dimension.to_string(),
                    });
                }
            }
        }

        let mut key = String::with_capacity(1 + indicator.as_str().len() + layout.len() * 3);
        key.push('.');
        key.push_str(indicator.as_str());
        for dimension in &layout {
            key.push('.');
            match mode {
                KeyMode::Totals => key.push_str(TOTAL),
                KeyMode::AllDisaggregations => {}
                KeyMode::UserFilters => key.push_str(filters.get(dimension).unwrap_or("")),
            }
        }

        for warning in &warnings {
            log::warn!("{warning}");
        }
        Ok(BuiltKey {
            key: QueryKey::new(key),
            layout,
            warnings,
        })
    }

    /// Whole-dataflow export key.
    pub fn build_bulk(&self) -> BuiltKey {
        BuiltKey {
            key: QueryKey::all(),
            layout: Vec::new(),
            warnings: Vec::new(),
        }
    }
}
