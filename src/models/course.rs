//! Course model matching the web client's Course interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{overlay, require, superseded, Entity, EntityKind, Patch};
use crate::errors::SyncError;

/// A course offered in the current semester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub name: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blc_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blc_enroll_key: Option<String>,
    pub created_at: String,
}

/// Request body for creating a course.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blc_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blc_enroll_key: Option<String>,
}

/// Request body for updating a course.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blc_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blc_enroll_key: Option<String>,
}

impl Entity for Course {
    type New = CreateCourseRequest;
    type Patch = UpdateCourseRequest;

    const KIND: EntityKind = EntityKind::Course;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate_new(input: &CreateCourseRequest) -> Result<(), SyncError> {
        require(&input.name, "name", "Course")?;
        require(&input.code, "code", "Course")
    }

    fn from_new(id: String, input: &CreateCourseRequest, now: DateTime<Utc>) -> Self {
        Course {
            id,
            name: input.name.clone(),
            code: input.code.clone(),
            teacher: input.teacher.clone(),
            description: input.description.clone(),
            telegram_link: input.telegram_link.clone(),
            blc_link: input.blc_link.clone(),
            blc_enroll_key: input.blc_enroll_key.clone(),
            created_at: now.to_rfc3339(),
        }
    }

    fn to_new(&self) -> CreateCourseRequest {
        CreateCourseRequest {
            name: self.name.clone(),
            code: self.code.clone(),
            teacher: self.teacher.clone(),
            description: self.description.clone(),
            telegram_link: self.telegram_link.clone(),
            blc_link: self.blc_link.clone(),
            blc_enroll_key: self.blc_enroll_key.clone(),
        }
    }
}

impl Patch<Course> for UpdateCourseRequest {
    fn apply_to(&self, course: &mut Course) {
        if let Some(name) = &self.name {
            course.name = name.clone();
        }
        if let Some(code) = &self.code {
            course.code = code.clone();
        }
        overlay(&mut course.teacher, self.teacher.clone());
        overlay(&mut course.description, self.description.clone());
        overlay(&mut course.telegram_link, self.telegram_link.clone());
        overlay(&mut course.blc_link, self.blc_link.clone());
        overlay(&mut course.blc_enroll_key, self.blc_enroll_key.clone());
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.name, later.name);
        overlay(&mut self.code, later.code);
        overlay(&mut self.teacher, later.teacher);
        overlay(&mut self.description, later.description);
        overlay(&mut self.telegram_link, later.telegram_link);
        overlay(&mut self.blc_link, later.blc_link);
        overlay(&mut self.blc_enroll_key, later.blc_enroll_key);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.name, &newer.name);
        superseded(&mut self.code, &newer.code);
        superseded(&mut self.teacher, &newer.teacher);
        superseded(&mut self.description, &newer.description);
        superseded(&mut self.telegram_link, &newer.telegram_link);
        superseded(&mut self.blc_link, &newer.blc_link);
        superseded(&mut self.blc_enroll_key, &newer.blc_enroll_key);
    }

    fn is_empty(&self) -> bool {
        *self == UpdateCourseRequest::default()
    }
}
