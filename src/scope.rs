use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ListingError;
use crate::snapshot::{SnapshotStore, SubgroupInfo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleFilter {
    #[default]
    OwnerAssistant,
    Owner,
    Assistant,
    None,
}

impl RoleFilter {
    fn accepts(self, role: Option<&str>) -> bool {
        match self {
            RoleFilter::OwnerAssistant => matches!(role, Some("OWNER" | "ASSISTANT")),
            RoleFilter::Owner => role == Some("OWNER"),
            RoleFilter::Assistant => role == Some("ASSISTANT"),
            RoleFilter::None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefilter {
    pub role: RoleFilter,
    pub subgroup_id: Option<String>,
    pub grant_number: Option<String>,
}

impl Prefilter {
    pub fn is_explicit(&self) -> bool {
        non_blank(self.subgroup_id.as_deref()).is_some()
            || non_blank(self.grant_number.as_deref()).is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// `None` means every known subgroup.
    pub subgroup_ids: Option<Vec<String>>,
    pub subgroup_order: Vec<String>,
}

impl Scope {
    pub fn all(subgroup_order: Vec<String>) -> Self {
        Self {
            subgroup_ids: None,
            subgroup_order,
        }
    }

    /// Single-flight key for the refresh coordinator.
    pub fn key(&self) -> String {
        match &self.subgroup_ids {
            None => "*".to_string(),
            Some(ids) => {
                let mut sorted = ids.clone();
                sorted.sort();
                sorted.dedup();
                sorted.join(",")
            }
        }
    }

    pub fn ids_or_empty(&self) -> &[String] {
        self.subgroup_ids.as_deref().unwrap_or(&[])
    }

    /// An explicit scope that matched no subgroup.
    pub fn is_empty(&self) -> bool {
        matches!(&self.subgroup_ids, Some(ids) if ids.is_empty())
    }

    /// Whether both scopes can aggregate at least one common subgroup.
    pub fn overlaps(&self, other: &Scope) -> bool {
        match (&self.subgroup_ids, &other.subgroup_ids) {
            (None, None) => true,
            (None, Some(ids)) | (Some(ids), None) => !ids.is_empty(),
            (Some(left), Some(right)) => left.iter().any(|id| right.contains(id)),
        }
    }

    pub fn contains(&self, subgroup_id: &str) -> bool {
        match &self.subgroup_ids {
            None => true,
            Some(ids) => ids.iter().any(|id| id == subgroup_id),
        }
    }
}

pub fn resolve_scope(snapshots: &SnapshotStore, prefilter: &Prefilter) -> Result<Scope, ListingError> {
    let groups: Vec<SubgroupInfo> = snapshots
        .load_subgroups()?
        .into_iter()
        .filter(SubgroupInfo::is_team)
        .collect();
    let user_id = snapshots.current_user_id();
    Ok(scope_for_groups(&groups, user_id.as_deref(), prefilter))
}

pub fn scope_for_groups(groups: &[SubgroupInfo], user_id: Option<&str>, prefilter: &Prefilter) -> Scope {
    let mut visible: Vec<&SubgroupInfo> = groups
        .iter()
        .filter(|group| prefilter.role.accepts(user_role(group, user_id)))
        .collect();
    if visible.is_empty() {
        visible = groups.iter().collect();
    }

    let subgroup_order: Vec<String> = visible
        .iter()
        .filter(|group| !group.id.is_empty())
        .map(|group| group.id.clone())
        .collect();

    let selected_subgroup = non_blank(prefilter.subgroup_id.as_deref());
    let selected_grant = non_blank(prefilter.grant_number.as_deref());

    let mut subgroup_ids = match selected_subgroup {
        Some(id) => vec![id.to_string()],
        None => subgroup_order.clone(),
    };
    if let Some(grant) = selected_grant {
        subgroup_ids.retain(|id| {
            visible
                .iter()
                .any(|group| &group.id == id && group.grants.iter().any(|g| g == grant))
        });
    }

    let explicit = prefilter.is_explicit();
    if !explicit && (prefilter.role == RoleFilter::None || subgroup_ids.is_empty()) {
        tracing::debug!(role = ?prefilter.role, "scope widened to all subgroups");
        return Scope::all(subgroup_order);
    }

    Scope {
        subgroup_ids: Some(subgroup_ids),
        subgroup_order,
    }
}

fn user_role<'a>(group: &'a SubgroupInfo, user_id: Option<&str>) -> Option<&'a str> {
    group
        .roles
        .iter()
        .find(|role| match user_id {
            Some(user_id) => role.user_id == user_id,
            None => true,
        })
        .map(|role| role.role.as_str())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
