use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

pub const USER_VARIABLE: &str = "${USER}";
pub const SOURCE_VARIABLE: &str = "${SOURCE}";

/// Fully resolved path of a resource group, rendered dotted
/// (`global.user-alice.dashboard-alice`). Segments never contain
/// template variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceGroupId(Vec<String>);

impl ResourceGroupId {
    pub fn new(segments: Vec<String>) -> Self {
        assert!(!segments.is_empty(), "Resource group path cannot be empty");
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn leaf_name(&self) -> &str {
        self.0.last().expect("Paths are non-empty by construction")
    }

    /// Path of the parent group, `None` for root groups.
    pub fn parent(&self) -> Option<ResourceGroupId> {
        match self.0.len() {
            1 => None,
            n => Some(ResourceGroupId(self.0[..n - 1].to_vec())),
        }
    }

    /// Paths from the root down to (and including) this group.
    pub fn ancestry(&self) -> impl Iterator<Item = ResourceGroupId> + '_ {
        (1..=self.0.len()).map(|n| ResourceGroupId(self.0[..n].to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for ResourceGroupId {
    type Err = GroupPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(GroupPathError::EmptySegment(s.to_owned()));
        }
        Ok(Self(segments))
    }
}

/// Path template as configured in the store. Segments may embed
/// `${USER}` / `${SOURCE}`, substituted per session at classification
/// time. A template without variables expands to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceGroupIdTemplate(Vec<String>);

impl ResourceGroupIdTemplate {
    pub fn new(segments: Vec<String>) -> Self {
        assert!(!segments.is_empty(), "Template path cannot be empty");
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn parent(&self) -> Option<ResourceGroupIdTemplate> {
        match self.0.len() {
            1 => None,
            n => Some(ResourceGroupIdTemplate(self.0[..n - 1].to_vec())),
        }
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn has_variables(&self) -> bool {
        self.0
            .iter()
            .any(|s| s.contains(USER_VARIABLE) || s.contains(SOURCE_VARIABLE))
    }

    /// Substitute session values into every segment.
    pub fn expand(
        &self,
        user: &str,
        source: Option<&str>,
    ) -> Result<ResourceGroupId, GroupPathError> {
        let segments = self
            .0
            .iter()
            .map(|segment| {
                let mut segment = segment.replace(USER_VARIABLE, user);
                if segment.contains(SOURCE_VARIABLE) {
                    let source = source.ok_or_else(|| {
                        GroupPathError::UnresolvedVariable(self.to_string())
                    })?;
                    segment = segment.replace(SOURCE_VARIABLE, source);
                }
                Ok(segment)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResourceGroupId::new(segments))
    }
}

impl fmt::Display for ResourceGroupIdTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for ResourceGroupIdTemplate {
    type Err = GroupPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(GroupPathError::EmptySegment(s.to_owned()));
        }
        Ok(Self(segments))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupPathError {
    #[error("Resource group path '{0}' contains an empty segment")]
    EmptySegment(String),
    #[error("Template '{0}' uses ${{SOURCE}} but the session has no source")]
    UnresolvedVariable(String),
}

/// Memory quantity as written in configuration: an absolute size
/// (`1MB`) or a percentage of the cluster memory (`10%`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MemoryLimit {
    Bytes(u64),
    Percent(f64),
}

impl MemoryLimit {
    /// Resolve against the configured total cluster memory.
    pub fn resolve(&self, cluster_memory_bytes: u64) -> u64 {
        match *self {
            MemoryLimit::Bytes(bytes) => bytes,
            MemoryLimit::Percent(pct) => {
                (cluster_memory_bytes as f64 * pct / 100.0) as u64
            }
        }
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MemoryLimit::Bytes(bytes) => {
                const UNITS: [(&str, u64); 4] = [
                    ("TB", 1 << 40),
                    ("GB", 1 << 30),
                    ("MB", 1 << 20),
                    ("kB", 1 << 10),
                ];
                for (unit, factor) in UNITS {
                    if bytes >= factor && bytes % factor == 0 {
                        return write!(f, "{}{}", bytes / factor, unit);
                    }
                }
                write!(f, "{}B", bytes)
            }
            MemoryLimit::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

impl FromStr for MemoryLimit {
    type Err = MemoryLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| MemoryLimitError::Malformed(s.to_owned()))?;
            if !(0.0..=100.0).contains(&value) {
                return Err(MemoryLimitError::PercentOutOfRange(s.to_owned()));
            }
            return Ok(MemoryLimit::Percent(value));
        }

        let unit_start = s
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| MemoryLimitError::Malformed(s.to_owned()))?;
        let (value, unit) = s.split_at(unit_start);
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| MemoryLimitError::Malformed(s.to_owned()))?;
        let factor: u64 = match unit.trim() {
            "B" => 1,
            "kB" => 1 << 10,
            "MB" => 1 << 20,
            "GB" => 1 << 30,
            "TB" => 1 << 40,
            _ => return Err(MemoryLimitError::UnknownUnit(s.to_owned())),
        };
        if value < 0.0 {
            return Err(MemoryLimitError::Malformed(s.to_owned()));
        }
        Ok(MemoryLimit::Bytes((value * factor as f64) as u64))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryLimitError {
    #[error("Malformed memory limit '{0}'")]
    Malformed(String),
    #[error("Memory limit '{0}' uses an unknown unit")]
    UnknownUnit(String),
    #[error("Percentage '{0}' must be between 0% and 100%")]
    PercentOutOfRange(String),
}

/// Dequeue order within a group and subgroup choice at internal nodes.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    EnumIter,
    EnumString,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "scheduling_policy")]
#[strum(ascii_case_insensitive)]
pub enum SchedulingPolicy {
    /// Oldest submission first.
    #[default]
    #[sea_orm(string_value = "fifo")]
    #[strum(serialize = "fifo")]
    Fifo,
    /// Admission slots spread across siblings proportional to weight.
    #[sea_orm(string_value = "weighted_fair")]
    #[strum(serialize = "weighted_fair")]
    WeightedFair,
    /// Most recently submitted first. Bounds tail latency for bursty
    /// interactive workloads at the cost of possible starvation.
    #[sea_orm(string_value = "RECENT_QUERIES")]
    #[strum(to_string = "RECENT_QUERIES", serialize = "recent_queries")]
    RecentQueries,
}

/// One configured group template with its path fully assembled from the
/// store's parent chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Store row id.
    pub id: i64,
    pub id_template: ResourceGroupIdTemplate,
    pub soft_memory_limit: MemoryLimit,
    pub hard_memory_limit: MemoryLimit,
    pub max_queued: u64,
    /// Hard concurrency limit (`maxRunningQueries`).
    pub hard_concurrency: u64,
    pub soft_concurrency: u64,
    pub soft_reserved_memory: Option<MemoryLimit>,
    pub hard_reserved_concurrency: Option<u64>,
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u64,
    /// Default priority of queries in this group; doubles as the
    /// threshold a query must exceed to consume reserved capacity.
    pub query_priority: i32,
    pub jmx_export: bool,
}

impl GroupSpec {
    pub const DEFAULT_SCHEDULING_WEIGHT: u64 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trips_through_display() {
        let id: ResourceGroupId = "global.user-bob.adhoc-bob".parse().unwrap();
        assert_eq!(id.segments().len(), 3);
        assert_eq!(id.leaf_name(), "adhoc-bob");
        assert_eq!(id.to_string(), "global.user-bob.adhoc-bob");
        assert_eq!(id.parent().unwrap().to_string(), "global.user-bob");
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert!("global..adhoc".parse::<ResourceGroupId>().is_err());
        assert!("".parse::<ResourceGroupId>().is_err());
    }

    #[test]
    fn template_expansion_substitutes_session_values() {
        let template: ResourceGroupIdTemplate =
            "global.user-${USER}.dashboard-${USER}".parse().unwrap();
        assert!(template.has_variables());

        let id = template.expand("alice", None).unwrap();
        assert_eq!(id.to_string(), "global.user-alice.dashboard-alice");
    }

    #[test]
    fn source_variable_requires_a_source() {
        let template: ResourceGroupIdTemplate = "global.${SOURCE}".parse().unwrap();
        assert!(template.expand("alice", None).is_err());
        assert_eq!(
            template.expand("alice", Some("cli")).unwrap().to_string(),
            "global.cli"
        );
    }

    #[test]
    fn memory_limits_parse_sizes_and_percentages() {
        assert_eq!("1MB".parse::<MemoryLimit>().unwrap(), MemoryLimit::Bytes(1 << 20));
        assert_eq!("2GB".parse::<MemoryLimit>().unwrap(), MemoryLimit::Bytes(2 << 30));
        assert_eq!("10%".parse::<MemoryLimit>().unwrap(), MemoryLimit::Percent(10.0));
        assert!("1XB".parse::<MemoryLimit>().is_err());
        assert!("150%".parse::<MemoryLimit>().is_err());

        assert_eq!(MemoryLimit::Percent(50.0).resolve(1 << 30), 1 << 29);
        assert_eq!(MemoryLimit::Bytes(42).resolve(1 << 30), 42);
    }

    #[test]
    fn scheduling_policy_accepts_store_spellings() {
        assert_eq!(
            "RECENT_QUERIES".parse::<SchedulingPolicy>().unwrap(),
            SchedulingPolicy::RecentQueries
        );
        assert_eq!(
            "weighted_fair".parse::<SchedulingPolicy>().unwrap(),
            SchedulingPolicy::WeightedFair
        );
        assert_eq!("fifo".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::Fifo);
    }
}
