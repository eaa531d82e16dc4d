//! Study material model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    is_temp_id, overlay, remap_id, remap_opt, require, superseded, Entity, EntityKind, IdMap,
    Patch,
};
use crate::errors::SyncError;

/// Lecture notes, slides and other files attached to a course.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudyMaterial {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub course_id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub file_urls: Vec<String>,
    #[serde(default)]
    pub original_file_names: Vec<String>,
    pub created_at: String,
}

/// Request body for creating a study material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMaterialRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub course_id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub file_urls: Vec<String>,
    #[serde(default)]
    pub original_file_names: Vec<String>,
}

/// Request body for updating a study material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMaterialRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_names: Option<Vec<String>>,
}

impl Entity for StudyMaterial {
    type New = CreateMaterialRequest;
    type Patch = UpdateMaterialRequest;

    const KIND: EntityKind = EntityKind::Material;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate_new(input: &CreateMaterialRequest) -> Result<(), SyncError> {
        require(&input.title, "title", "Study material")?;
        require(&input.course_id, "courseId", "Study material")
    }

    fn from_new(id: String, input: &CreateMaterialRequest, now: DateTime<Utc>) -> Self {
        StudyMaterial {
            id,
            title: input.title.clone(),
            description: input.description.clone(),
            course_id: input.course_id.clone(),
            category: input.category.clone(),
            file_urls: input.file_urls.clone(),
            original_file_names: input.original_file_names.clone(),
            created_at: now.to_rfc3339(),
        }
    }

    fn to_new(&self) -> CreateMaterialRequest {
        CreateMaterialRequest {
            title: self.title.clone(),
            description: self.description.clone(),
            course_id: self.course_id.clone(),
            category: self.category.clone(),
            file_urls: self.file_urls.clone(),
            original_file_names: self.original_file_names.clone(),
        }
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        remap_id(&mut self.course_id, ids)
    }

    fn references_unsynced(&self) -> bool {
        is_temp_id(&self.course_id)
    }
}

impl Patch<StudyMaterial> for UpdateMaterialRequest {
    fn apply_to(&self, material: &mut StudyMaterial) {
        if let Some(title) = &self.title {
            material.title = title.clone();
        }
        if let Some(description) = &self.description {
            material.description = description.clone();
        }
        if let Some(course_id) = &self.course_id {
            material.course_id = course_id.clone();
        }
        if let Some(category) = &self.category {
            material.category = category.clone();
        }
        if let Some(file_urls) = &self.file_urls {
            material.file_urls = file_urls.clone();
        }
        if let Some(names) = &self.original_file_names {
            material.original_file_names = names.clone();
        }
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.title, later.title);
        overlay(&mut self.description, later.description);
        overlay(&mut self.course_id, later.course_id);
        overlay(&mut self.category, later.category);
        overlay(&mut self.file_urls, later.file_urls);
        overlay(&mut self.original_file_names, later.original_file_names);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.title, &newer.title);
        superseded(&mut self.description, &newer.description);
        superseded(&mut self.course_id, &newer.course_id);
        superseded(&mut self.category, &newer.category);
        superseded(&mut self.file_urls, &newer.file_urls);
        superseded(&mut self.original_file_names, &newer.original_file_names);
    }

    fn is_empty(&self) -> bool {
        *self == UpdateMaterialRequest::default()
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        remap_opt(&mut self.course_id, ids)
    }

    fn references_unsynced(&self) -> bool {
        self.course_id.as_deref().is_some_and(is_temp_id)
    }
}
