//! Property groups: one physical room listed on several channels.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_GROUP_UNITS;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("property group '{0}' not found")]
    NotFound(String),
    #[error("no units linked to property group '{0}'")]
    NoUnits(String),
    #[error("reading groups file: {0}")]
    Io(#[from] std::io::Error),
    #[error("groups file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("group '{0}' lists more than {MAX_GROUP_UNITS} units")]
    TooManyUnits(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyGroup {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub unit_ids: Vec<Ulid>,
    /// Unit whose rate plan prices the group. Defaults to the first unit.
    #[serde(default)]
    pub pricing_unit_id: Option<Ulid>,
}

impl PropertyGroup {
    pub fn pricing_unit(&self) -> Option<Ulid> {
        self.pricing_unit_id.or_else(|| self.unit_ids.first().copied())
    }
}

#[derive(Debug, Default, Deserialize)]
struct GroupsFile {
    #[serde(default)]
    groups: BTreeMap<String, PropertyGroup>,
}

/// Read-only slug → group map, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Groups {
    groups: BTreeMap<String, PropertyGroup>,
}

impl Groups {
    pub fn new(groups: BTreeMap<String, PropertyGroup>) -> Self {
        Self { groups }
    }

    /// A missing file is an empty set of groups.
    pub fn load(path: &Path) -> Result<Self, GroupError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("groups file {} not found, no property groups", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let groups = Self::from_json(&raw)?;
        tracing::info!("loaded {} property groups from {}", groups.len(), path.display());
        Ok(groups)
    }

    pub fn from_json(raw: &str) -> Result<Self, GroupError> {
        let file: GroupsFile = serde_json::from_str(raw)?;
        if let Some((slug, _)) = file
            .groups
            .iter()
            .find(|(_, g)| g.unit_ids.len() > MAX_GROUP_UNITS)
        {
            return Err(GroupError::TooManyUnits(slug.clone()));
        }
        Ok(Self::new(file.groups))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, slug: &str) -> Result<&PropertyGroup, GroupError> {
        self.groups
            .get(slug)
            .ok_or_else(|| GroupError::NotFound(slug.to_string()))
    }

    /// The group's units; a group without units cannot be booked or synced.
    pub fn unit_ids(&self, slug: &str) -> Result<&[Ulid], GroupError> {
        let group = self.get(slug)?;
        if group.unit_ids.is_empty() {
            return Err(GroupError::NoUnits(slug.to_string()));
        }
        Ok(&group.unit_ids)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyGroup)> {
        self.groups.iter().map(|(slug, g)| (slug.as_str(), g))
    }
}
