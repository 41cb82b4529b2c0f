//! Domain model and parameter-space generation for the ScanSante
//! cartographie-activite-MCO collector.

use std::path::PathBuf;

use serde::Serialize;

pub const CRATE_NAME: &str = "carto-core";

/// Years requested, most recent first.
pub const YEARS: [u16; 5] = [2024, 2023, 2022, 2021, 2020];

/// National geographic code used with [`GeoScope::Nation`].
pub const NATIONAL_GEO_CODE: &str = "99";

/// Representative department sample for the medium-priority cross-check pass.
pub const DEPARTMENT_SAMPLE: [&str; 5] = ["75", "13", "69", "59", "33"];

/// Overseas department codes that structurally return no private-sector data.
pub const OVERSEAS_DEPARTMENTS: [&str; 5] = ["971", "972", "973", "974", "976"];

/// Regional figures only exist for the post-reform region layout.
pub const REGION_REFORM_YEAR: u16 = 2016;

/// Geographic scope of a query, serialized as the `tgeo` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoScope {
    Nation,
    Region,
    Department,
}

impl GeoScope {
    pub fn wire_code(self) -> &'static str {
        match self {
            GeoScope::Nation => "fe",
            GeoScope::Region => "reg",
            GeoScope::Department => "dept",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            GeoScope::Nation => "national",
            GeoScope::Region => "regional",
            GeoScope::Department => "departemental",
        }
    }
}

/// Establishment category, serialized as the `base` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstablishmentCategory {
    Public,
    Private,
    All,
}

impl EstablishmentCategory {
    pub fn wire_code(self) -> &'static str {
        match self {
            EstablishmentCategory::Public => "bpub",
            EstablishmentCategory::Private => "bpriv",
            EstablishmentCategory::All => "tous",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            EstablishmentCategory::Public => "public",
            EstablishmentCategory::Private => "prive",
            EstablishmentCategory::All => "tous",
        }
    }

    pub fn all() -> [EstablishmentCategory; 3] {
        [
            EstablishmentCategory::Public,
            EstablishmentCategory::Private,
            EstablishmentCategory::All,
        ]
    }
}

/// Activity-of-care filter (`ASO` parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityFilter {
    Medicine,
    Surgery,
    Obstetrics,
}

impl ActivityFilter {
    pub fn wire_code(self) -> &'static str {
        match self {
            ActivityFilter::Medicine => "M",
            ActivityFilter::Surgery => "C",
            ActivityFilter::Obstetrics => "O",
        }
    }

    pub fn all() -> [ActivityFilter; 3] {
        [
            ActivityFilter::Medicine,
            ActivityFilter::Surgery,
            ActivityFilter::Obstetrics,
        ]
    }
}

/// Care-category filter (`CAS` parameter). Mutually exclusive with
/// [`ActivityFilter`] on any single combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CareCategory {
    Surgery,
    Medicine,
    Obstetrics,
}

impl CareCategory {
    pub fn wire_code(self) -> &'static str {
        match self {
            CareCategory::Surgery => "C",
            CareCategory::Medicine => "M",
            CareCategory::Obstetrics => "O",
        }
    }

    pub fn all() -> [CareCategory; 3] {
        [
            CareCategory::Surgery,
            CareCategory::Medicine,
            CareCategory::Obstetrics,
        ]
    }
}

/// How the server aggregates results, serialized as `typrgp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    AllStays,
    ByActivity,
    ByCategory,
}

impl AggregationMode {
    pub fn wire_code(self) -> &'static str {
        match self {
            AggregationMode::AllStays => "tous",
            // Both grouped modes go through the rgpGHM regrouping on the server.
            AggregationMode::ByActivity | AggregationMode::ByCategory => "rgpGHM",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            AggregationMode::AllStays => "tous_sejours",
            AggregationMode::ByActivity => "par_activite",
            AggregationMode::ByCategory => "par_categorie",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
}

/// Which slice of the parameter space to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStrategy {
    /// National coverage plus the department cross-check sample.
    #[default]
    Full,
    /// National coverage only.
    NationalOnly,
}

/// One immutable point in the (year x geography x establishment x filter)
/// request space. Construct through [`RequestCombination::all_stays`],
/// [`RequestCombination::by_activity`] or [`RequestCombination::by_category`]
/// so that at most one of the two filters is ever set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestCombination {
    year: u16,
    geo_scope: GeoScope,
    geo_code: String,
    establishment: EstablishmentCategory,
    activity_filter: Option<ActivityFilter>,
    category_filter: Option<CareCategory>,
    aggregation: AggregationMode,
    priority: Priority,
}

impl RequestCombination {
    pub fn all_stays(
        year: u16,
        geo_scope: GeoScope,
        geo_code: impl Into<String>,
        establishment: EstablishmentCategory,
        priority: Priority,
    ) -> Self {
        Self {
            year,
            geo_scope,
            geo_code: geo_code.into(),
            establishment,
            activity_filter: None,
            category_filter: None,
            aggregation: AggregationMode::AllStays,
            priority,
        }
    }

    pub fn by_activity(
        year: u16,
        geo_scope: GeoScope,
        geo_code: impl Into<String>,
        establishment: EstablishmentCategory,
        activity: ActivityFilter,
        priority: Priority,
    ) -> Self {
        Self {
            year,
            geo_scope,
            geo_code: geo_code.into(),
            establishment,
            activity_filter: Some(activity),
            category_filter: None,
            aggregation: AggregationMode::ByActivity,
            priority,
        }
    }

    pub fn by_category(
        year: u16,
        geo_scope: GeoScope,
        geo_code: impl Into<String>,
        establishment: EstablishmentCategory,
        category: CareCategory,
        priority: Priority,
    ) -> Self {
        Self {
            year,
            geo_scope,
            geo_code: geo_code.into(),
            establishment,
            activity_filter: None,
            category_filter: Some(category),
            aggregation: AggregationMode::ByCategory,
            priority,
        }
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn geo_scope(&self) -> GeoScope {
        self.geo_scope
    }

    pub fn geo_code(&self) -> &str {
        &self.geo_code
    }

    pub fn establishment(&self) -> EstablishmentCategory {
        self.establishment
    }

    pub fn activity_filter(&self) -> Option<ActivityFilter> {
        self.activity_filter
    }

    pub fn category_filter(&self) -> Option<CareCategory> {
        self.category_filter
    }

    pub fn aggregation(&self) -> AggregationMode {
        self.aggregation
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The full query-string parameter set for the submit endpoint. Unset
    /// filters are sent as empty strings, never omitted: the server treats a
    /// missing key differently from an empty one.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("snatnav", String::new()),
            ("annee", self.year.to_string()),
            ("tgeo", self.geo_scope.wire_code().to_string()),
            ("codegeo", self.geo_code.clone()),
            ("base", self.establishment.wire_code().to_string()),
            (
                "ASO",
                self.activity_filter
                    .map(|a| a.wire_code().to_string())
                    .unwrap_or_default(),
            ),
            (
                "CAS",
                self.category_filter
                    .map(|c| c.wire_code().to_string())
                    .unwrap_or_default(),
            ),
            ("typrgp", self.aggregation.wire_code().to_string()),
            ("DA", String::new()),
            ("GP", String::new()),
            ("racine", String::new()),
            ("GHM", String::new()),
        ]
    }

    /// Deterministic artifact file name; reruns of the same combination
    /// overwrite rather than accumulate.
    pub fn file_name(&self) -> String {
        let aso = self
            .activity_filter
            .map(|a| format!("_ASO{}", a.wire_code()))
            .unwrap_or_default();
        let cas = self
            .category_filter
            .map(|c| format!("_CAS{}", c.wire_code()))
            .unwrap_or_default();
        format!(
            "scan_{}_{}_{}_{}{}{}.csv",
            self.year,
            self.geo_scope.wire_code(),
            self.geo_code,
            self.aggregation.wire_code(),
            aso,
            cas
        )
    }

    /// Relative classification path for the raw artifact tree:
    /// geography / establishment type / data type.
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(self.geo_scope.dir_name())
            .join(self.establishment.dir_name())
            .join(self.aggregation.dir_name())
    }

    /// Short progress label shown by the dashboard.
    pub fn label(&self) -> String {
        let filter = match (self.activity_filter, self.category_filter) {
            (Some(a), _) => format!(" ASO={}", a.wire_code()),
            (_, Some(c)) => format!(" CAS={}", c.wire_code()),
            _ => String::new(),
        };
        format!(
            "{} {}/{} {} {}{}",
            self.year,
            self.geo_scope.wire_code(),
            self.geo_code,
            self.establishment.wire_code(),
            self.aggregation.wire_code(),
            filter
        )
    }
}

/// Tagged result of one combination's extraction attempt. `EmptyZone` and
/// `MinimalData` are legitimate outcomes of a query over an inactive zone,
/// not pipeline defects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOutcome {
    Success {
        rows: usize,
        columns: usize,
        artifact: PathBuf,
    },
    EmptyZone,
    MinimalData {
        rows: usize,
    },
    Failed {
        reason: String,
    },
}

/// Ordered headers plus ordered rows of normalized cell text. Every row has
/// the same arity as the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }
}

/// Enumerates every combination to request, in a deterministic order:
/// national coverage first (year outer, establishment inner; all-stays tagged
/// critical before the grouped slices tagged high), then the department
/// cross-check sample tagged medium.
pub fn combinations_for(strategy: CollectionStrategy) -> Vec<RequestCombination> {
    let mut out = Vec::new();

    for &year in &YEARS {
        for establishment in EstablishmentCategory::all() {
            out.push(RequestCombination::all_stays(
                year,
                GeoScope::Nation,
                NATIONAL_GEO_CODE,
                establishment,
                Priority::Critical,
            ));
            for activity in ActivityFilter::all() {
                out.push(RequestCombination::by_activity(
                    year,
                    GeoScope::Nation,
                    NATIONAL_GEO_CODE,
                    establishment,
                    activity,
                    Priority::High,
                ));
            }
            for category in CareCategory::all() {
                out.push(RequestCombination::by_category(
                    year,
                    GeoScope::Nation,
                    NATIONAL_GEO_CODE,
                    establishment,
                    category,
                    Priority::High,
                ));
            }
        }
    }

    if strategy == CollectionStrategy::Full {
        let recent = YEARS[0];
        for department in DEPARTMENT_SAMPLE {
            out.push(RequestCombination::all_stays(
                recent,
                GeoScope::Department,
                department,
                EstablishmentCategory::Public,
                Priority::Medium,
            ));
        }
    }

    out
}

pub fn combinations() -> Vec<RequestCombination> {
    combinations_for(CollectionStrategy::Full)
}

/// Advisory pruning of combinations known a priori to be unproductive.
/// Pure and deterministic; false negatives are acceptable collateral, false
/// positives simply surface later as `EmptyZone`.
pub fn validate(combination: &RequestCombination) -> bool {
    if combination.geo_scope() == GeoScope::Region && combination.year() < REGION_REFORM_YEAR {
        return false;
    }
    if combination.establishment() == EstablishmentCategory::Private
        && OVERSEAS_DEPARTMENTS.contains(&combination.geo_code())
    {
        return false;
    }
    true
}
