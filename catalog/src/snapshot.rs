//! Assembly of raw store rows into a [`ConfigSnapshot`]: parent chains
//! become full path templates, string limits are parsed, and structural
//! problems surface as [`SnapshotError`] so a bad configuration is
//! rejected wholesale instead of half-applied.

use model::config::ConfigSnapshot;
use model::group::{GroupSpec, MemoryLimit, MemoryLimitError, ResourceGroupIdTemplate};
use model::selector::SelectorSpec;
use model::store::{resource_group, selector};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Group {id} references unknown parent {parent}")]
    UnknownParent { id: i64, parent: i64 },
    #[error("Parent chain of group {id} contains a cycle")]
    ParentCycle { id: i64 },
    #[error("Duplicate group path template '{template}'")]
    DuplicateTemplate { template: String },
    #[error("Group {id} has a malformed memory limit: {source}")]
    MalformedMemoryLimit {
        id: i64,
        #[source]
        source: MemoryLimitError,
    },
    #[error("Group {id} column '{column}' is out of range")]
    LimitOutOfRange { id: i64, column: &'static str },
    #[error("Selector {id} references unknown group {group}")]
    UnknownSelectorGroup { id: i64, group: i64 },
}

pub(crate) fn assemble(
    groups: Vec<resource_group::Model>,
    selectors: Vec<selector::Model>,
    environment: &str,
) -> Result<ConfigSnapshot, SnapshotError> {
    // Rows without an environment apply everywhere; rows with one only
    // to the matching kernel.
    let rows: HashMap<i64, &resource_group::Model> = groups
        .iter()
        .filter(|row| {
            row.environment
                .as_deref()
                .is_none_or(|env| env == environment)
        })
        .map(|row| (row.id, row))
        .collect();

    let mut specs = Vec::with_capacity(rows.len());
    let mut seen_templates: HashMap<String, i64> = HashMap::new();
    let mut ordered: Vec<&resource_group::Model> = rows.values().copied().collect();
    ordered.sort_by_key(|row| row.id);

    for row in ordered {
        let template = template_path(row, &rows)?;
        if let Some(_first) = seen_templates.insert(template.to_string(), row.id) {
            return Err(SnapshotError::DuplicateTemplate {
                template: template.to_string(),
            });
        }
        specs.push(group_spec(row, template)?);
    }

    let templates_by_id: HashMap<i64, &ResourceGroupIdTemplate> =
        specs.iter().map(|spec| (spec.id, &spec.id_template)).collect();

    let mut selector_specs = Vec::with_capacity(selectors.len());
    for row in &selectors {
        let Some(template) = templates_by_id.get(&row.resource_group_id) else {
            // The foreign key guarantees the id exists; a miss means the
            // target belongs to a different environment.
            if groups.iter().any(|g| g.id == row.resource_group_id) {
                continue;
            }
            return Err(SnapshotError::UnknownSelectorGroup {
                id: row.id,
                group: row.resource_group_id,
            });
        };
        selector_specs.push(SelectorSpec {
            id: row.id,
            group_id: row.resource_group_id,
            group_template: (*template).clone(),
            priority: row.priority,
            user_regex: row.user_regex.clone(),
            source_regex: row.source_regex.clone(),
            query_type: row.query_type,
            client_tags: row
                .client_tags
                .clone()
                .map(|tags| tags.0)
                .unwrap_or_default(),
            schema_regex: row.schema_regex.clone(),
            action: row.action.unwrap_or_default(),
        });
    }

    // Evaluation order: priority descending, insertion order on ties.
    selector_specs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    Ok(ConfigSnapshot {
        groups: specs,
        selectors: selector_specs,
    })
}

fn template_path(
    row: &resource_group::Model,
    rows: &HashMap<i64, &resource_group::Model>,
) -> Result<ResourceGroupIdTemplate, SnapshotError> {
    let mut segments = vec![row.name.clone()];
    let mut current = row;
    // A chain longer than the row count must revisit a row.
    for _ in 0..rows.len() {
        let Some(parent_id) = current.parent else {
            segments.reverse();
            return Ok(ResourceGroupIdTemplate::new(segments));
        };
        current = rows.get(&parent_id).ok_or(SnapshotError::UnknownParent {
            id: current.id,
            parent: parent_id,
        })?;
        segments.push(current.name.clone());
    }
    Err(SnapshotError::ParentCycle { id: row.id })
}

fn group_spec(
    row: &resource_group::Model,
    id_template: ResourceGroupIdTemplate,
) -> Result<GroupSpec, SnapshotError> {
    let memory = |value: &str| {
        value
            .parse::<MemoryLimit>()
            .map_err(|source| SnapshotError::MalformedMemoryLimit { id: row.id, source })
    };
    let non_negative = |value: i64, column: &'static str| {
        u64::try_from(value).map_err(|_| SnapshotError::LimitOutOfRange { id: row.id, column })
    };

    let hard_concurrency = non_negative(row.hard_concurrency, "hard_concurrency")?;
    Ok(GroupSpec {
        id: row.id,
        id_template,
        soft_memory_limit: memory(&row.soft_memory_limit)?,
        hard_memory_limit: memory(&row.hard_memory_limit)?,
        max_queued: non_negative(row.max_queued, "max_queued")?,
        hard_concurrency,
        soft_concurrency: match row.soft_concurrency {
            Some(limit) => non_negative(limit, "soft_concurrency")?,
            None => hard_concurrency,
        },
        soft_reserved_memory: row
            .soft_reserved_memory
            .as_deref()
            .map(memory)
            .transpose()?,
        hard_reserved_concurrency: row
            .hard_reserved_concurrency
            .map(|slots| non_negative(slots, "hard_reserved_concurrency"))
            .transpose()?,
        scheduling_policy: row.scheduling_policy.unwrap_or_default(),
        scheduling_weight: match row.scheduling_weight {
            Some(weight) if weight >= 1 => weight as u64,
            Some(_) => {
                return Err(SnapshotError::LimitOutOfRange {
                    id: row.id,
                    column: "scheduling_weight",
                });
            }
            None => GroupSpec::DEFAULT_SCHEDULING_WEIGHT,
        },
        query_priority: row.query_priority.unwrap_or(0),
        jmx_export: row.jmx_export.unwrap_or(false),
    })
}
