//! Datastream → metric classification.
//!
//! Classification is an ordered table of [`Rule`]s; the first rule whose
//! predicate matches decides the category. Rules come in three stages:
//!
//! 1. **Category tag**: the controlled `Datastream_Category_type=...`
//!    label some deployments embed in the description.
//! 2. **Keywords**: curated keyword lists over name, description,
//!    observed property and unit text.
//! 3. **Unit**: the unit alone, only reached when no keyword matched.
//!
//! Nothing here does I/O or keeps state, so the same metadata always maps
//! to the same category. The catalog sync relies on that when it
//! reclassifies every datastream on every run.

use crate::model::Metric;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// The metadata a datastream is classified from.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatastreamMetadata<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub observed_property: &'a str,
    pub unit_name: &'a str,
    pub unit_symbol: &'a str,
    /// Name of the owning station; only used to pick a water-level subtype.
    pub station_name: &'a str,
}

/// Pre-computed search texts, built once per datastream.
struct Haystack<'a> {
    /// Description as-is (category tags are matched case-sensitively).
    description: &'a str,
    /// Lowercased `name description observed_property unit_name unit_symbol`.
    lexical: String,
    /// Lowercased `name observed_property description`.
    cumulative: String,
    /// Lowercased `name description station_name`.
    subtype: String,
    /// Lowercased, trimmed unit name and symbol.
    units: [String; 2],
}

impl<'a> Haystack<'a> {
    fn new(meta: &DatastreamMetadata<'a>) -> Self {
        Self {
            description: meta.description,
            lexical: format!(
                "{} {} {} {} {}",
                meta.name,
                meta.description,
                meta.observed_property,
                meta.unit_name,
                meta.unit_symbol
            )
            .to_lowercase(),
            cumulative: format!(
                "{} {} {}",
                meta.name, meta.observed_property, meta.description
            )
            .to_lowercase(),
            subtype: format!("{} {} {}", meta.name, meta.description, meta.station_name)
                .to_lowercase(),
            units: [
                meta.unit_name.trim().to_lowercase(),
                meta.unit_symbol.trim().to_lowercase(),
            ],
        }
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Category tags, matched against the raw description.
pub const TAG_RIVER_LEVEL: &[&str] = &["河川水位站"];
pub const TAG_GROUNDWATER_LEVEL: &[&str] = &["地下水位站"];
pub const TAG_DRAINAGE_LEVEL: &[&str] = &["區域排水水位站"];
pub const TAG_RAIN_GAUGE: &[&str] = &["雨量感測器"];
pub const TAG_FLOW_SENSOR: &[&str] = &["流量感測器"];

/// Keyword lists, matched against lowercased text.
pub const RAIN_KEYWORDS: &[&str] = &["rain", "rainfall", "precip", "降雨", "雨量"];
/// Words that contain a rain keyword without meaning rain.
pub const RAIN_LOOKALIKES: &[&str] = &["drain"];
pub const FLOW_KEYWORDS: &[&str] = &["discharge", "flow", "流量", "cms", "m3/s", "cumec"];
pub const CUMULATIVE_KEYWORDS: &[&str] = &["accum", "cumulative", "total", "累計", "累積"];
pub const WATER_LEVEL_KEYWORDS: &[&str] = &["waterlevel", "water level", "stage", "水位"];

/// Unit spellings, matched exactly against the unit name or symbol.
pub const DISCHARGE_UNITS: &[&str] = &[
    "m3/s",
    "m³/s",
    "cms",
    "cumec",
    "立方公尺/秒",
    "立方公尺每秒",
    "cubic meter per second",
];
pub const VOLUME_UNITS: &[&str] = &["m3", "m³", "立方公尺", "cubic meter"];
pub const RAIN_DEPTH_UNITS: &[&str] = &["mm", "毫米", "millimeter"];
pub const LENGTH_UNITS: &[&str] = &["m", "公尺", "meter", "metre", "cm", "公分"];

/// Substrings that pick a water-level subtype, checked in order.
pub const WATER_LEVEL_SUBTYPES: &[(&[&str], Metric)] = &[
    (&["河川", "river"], Metric::RiverWaterLevel),
    (&["地下", "groundwater"], Metric::GroundwaterLevel),
    (&["區域排水", "排水", "drainage"], Metric::DrainageWaterLevel),
];

/// Subtype for a water-level stream with no river / groundwater / drainage
/// hint. Most untagged level streams observed so far are river gauges, but
/// this is a heuristic guess, not a verified rule.
pub const DEFAULT_WATER_LEVEL: Metric = Metric::RiverWaterLevel;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CategoryTag,
    Keyword,
    Unit,
}

#[derive(Debug, Clone, Copy)]
pub enum Predicate {
    /// Raw description contains any tag.
    DescriptionTag(&'static [&'static str]),
    /// Lowercased text contains any keyword.
    Keywords(&'static [&'static str]),
    /// Lowercased text contains any keyword once the lookalike words
    /// (second list) are blanked out.
    KeywordsExcept(&'static [&'static str], &'static [&'static str]),
    /// Lowercased text contains a keyword from both lists.
    KeywordsWith(&'static [&'static str], &'static [&'static str]),
    /// Unit name or symbol equals one of the spellings.
    UnitIs(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Fixed(Metric),
    /// Cumulative keywords present → cumulative discharge, else instantaneous.
    DischargeKind,
    /// River / groundwater / drainage by subtype hints, else the default.
    WaterLevelKind,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub label: &'static str,
    pub stage: Stage,
    pub predicate: Predicate,
    pub outcome: Outcome,
}

/// The classification chain, evaluated top to bottom.
pub static RULES: &[Rule] = &[
    Rule {
        label: "tag:river_level_station",
        stage: Stage::CategoryTag,
        predicate: Predicate::DescriptionTag(TAG_RIVER_LEVEL),
        outcome: Outcome::Fixed(Metric::RiverWaterLevel),
    },
    Rule {
        label: "tag:groundwater_level_station",
        stage: Stage::CategoryTag,
        predicate: Predicate::DescriptionTag(TAG_GROUNDWATER_LEVEL),
        outcome: Outcome::Fixed(Metric::GroundwaterLevel),
    },
    Rule {
        label: "tag:drainage_level_station",
        stage: Stage::CategoryTag,
        predicate: Predicate::DescriptionTag(TAG_DRAINAGE_LEVEL),
        outcome: Outcome::Fixed(Metric::DrainageWaterLevel),
    },
    Rule {
        label: "tag:rain_gauge",
        stage: Stage::CategoryTag,
        predicate: Predicate::DescriptionTag(TAG_RAIN_GAUGE),
        outcome: Outcome::Fixed(Metric::Rainfall),
    },
    Rule {
        label: "tag:flow_sensor",
        stage: Stage::CategoryTag,
        predicate: Predicate::DescriptionTag(TAG_FLOW_SENSOR),
        outcome: Outcome::DischargeKind,
    },
    Rule {
        label: "keyword:rainfall",
        stage: Stage::Keyword,
        predicate: Predicate::KeywordsExcept(RAIN_KEYWORDS, RAIN_LOOKALIKES),
        outcome: Outcome::Fixed(Metric::Rainfall),
    },
    Rule {
        label: "keyword:cumulative_discharge",
        stage: Stage::Keyword,
        predicate: Predicate::KeywordsWith(CUMULATIVE_KEYWORDS, FLOW_KEYWORDS),
        outcome: Outcome::Fixed(Metric::DischargeCumulative),
    },
    Rule {
        label: "keyword:discharge",
        stage: Stage::Keyword,
        predicate: Predicate::Keywords(FLOW_KEYWORDS),
        outcome: Outcome::Fixed(Metric::Discharge),
    },
    Rule {
        label: "keyword:water_level",
        stage: Stage::Keyword,
        predicate: Predicate::Keywords(WATER_LEVEL_KEYWORDS),
        outcome: Outcome::WaterLevelKind,
    },
    Rule {
        label: "unit:discharge",
        stage: Stage::Unit,
        predicate: Predicate::UnitIs(DISCHARGE_UNITS),
        outcome: Outcome::Fixed(Metric::Discharge),
    },
    Rule {
        label: "unit:volume",
        stage: Stage::Unit,
        predicate: Predicate::UnitIs(VOLUME_UNITS),
        outcome: Outcome::Fixed(Metric::DischargeCumulative),
    },
    Rule {
        label: "unit:rain_depth",
        stage: Stage::Unit,
        predicate: Predicate::UnitIs(RAIN_DEPTH_UNITS),
        outcome: Outcome::Fixed(Metric::Rainfall),
    },
    // Rain keywords were already ruled out by the keyword stage.
    Rule {
        label: "unit:length",
        stage: Stage::Unit,
        predicate: Predicate::UnitIs(LENGTH_UNITS),
        outcome: Outcome::WaterLevelKind,
    },
];

impl Predicate {
    fn matches(&self, hay: &Haystack<'_>) -> bool {
        match self {
            Predicate::DescriptionTag(tags) => contains_any(hay.description, tags),
            Predicate::Keywords(words) => contains_any(&hay.lexical, words),
            Predicate::KeywordsExcept(words, lookalikes) => {
                let masked = lookalikes
                    .iter()
                    .fold(hay.lexical.clone(), |text, word| text.replace(*word, " "));
                contains_any(&masked, words)
            }
            Predicate::KeywordsWith(a, b) => {
                contains_any(&hay.lexical, a) && contains_any(&hay.lexical, b)
            }
            Predicate::UnitIs(units) => hay
                .units
                .iter()
                .any(|u| !u.is_empty() && units.iter().any(|unit| *unit == u.as_str())),
        }
    }
}

impl Outcome {
    fn resolve(&self, hay: &Haystack<'_>) -> Metric {
        match self {
            Outcome::Fixed(metric) => *metric,
            Outcome::DischargeKind => {
                if contains_any(&hay.cumulative, CUMULATIVE_KEYWORDS) {
                    Metric::DischargeCumulative
                } else {
                    Metric::Discharge
                }
            }
            Outcome::WaterLevelKind => WATER_LEVEL_SUBTYPES
                .iter()
                .find(|(hints, _)| contains_any(&hay.subtype, hints))
                .map(|(_, metric)| *metric)
                .unwrap_or(DEFAULT_WATER_LEVEL),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// The first rule that matches, with the category it resolves to.
pub fn matching_rule(meta: &DatastreamMetadata<'_>) -> Option<(&'static Rule, Metric)> {
    let hay = Haystack::new(meta);
    RULES
        .iter()
        .find(|rule| rule.predicate.matches(&hay))
        .map(|rule| (rule, rule.outcome.resolve(&hay)))
}

/// Classifies a datastream; `None` means unclassified.
pub fn classify(meta: &DatastreamMetadata<'_>) -> Option<Metric> {
    matching_rule(meta).map(|(_, metric)| metric)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
