//! Teacher model matching the web client's Teacher interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    is_temp_id, overlay, remap_all, require, superseded, Entity, EntityKind, IdMap, Patch,
};
use crate::errors::SyncError;

/// A faculty member and the courses they teach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub office_room: Option<String>,
    #[serde(default)]
    pub course_ids: Vec<String>,
    pub created_at: String,
}

/// Request body for creating a teacher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTeacherRequest {
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office_room: Option<String>,
    #[serde(default)]
    pub course_ids: Vec<String>,
}

/// Request body for updating a teacher.
///
/// `course_ids` replaces the whole assignment list when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTeacherRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office_room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_ids: Option<Vec<String>>,
}

impl Entity for Teacher {
    type New = CreateTeacherRequest;
    type Patch = UpdateTeacherRequest;

    const KIND: EntityKind = EntityKind::Teacher;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate_new(input: &CreateTeacherRequest) -> Result<(), SyncError> {
        require(&input.name, "name", "Teacher")?;
        require(&input.phone, "phone", "Teacher")
    }

    fn from_new(id: String, input: &CreateTeacherRequest, now: DateTime<Utc>) -> Self {
        Teacher {
            id,
            name: input.name.clone(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            department: input.department.clone(),
            office_room: input.office_room.clone(),
            course_ids: input.course_ids.clone(),
            created_at: now.to_rfc3339(),
        }
    }

    fn to_new(&self) -> CreateTeacherRequest {
        CreateTeacherRequest {
            name: self.name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            department: self.department.clone(),
            office_room: self.office_room.clone(),
            course_ids: self.course_ids.clone(),
        }
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        remap_all(&mut self.course_ids, ids)
    }

    fn references_unsynced(&self) -> bool {
        self.course_ids.iter().any(|id| is_temp_id(id))
    }
}

impl Patch<Teacher> for UpdateTeacherRequest {
    fn apply_to(&self, teacher: &mut Teacher) {
        if let Some(name) = &self.name {
            teacher.name = name.clone();
        }
        if let Some(phone) = &self.phone {
            teacher.phone = phone.clone();
        }
        overlay(&mut teacher.email, self.email.clone());
        overlay(&mut teacher.department, self.department.clone());
        overlay(&mut teacher.office_room, self.office_room.clone());
        if let Some(course_ids) = &self.course_ids {
            teacher.course_ids = course_ids.clone();
        }
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.name, later.name);
        overlay(&mut self.phone, later.phone);
        overlay(&mut self.email, later.email);
        overlay(&mut self.department, later.department);
        overlay(&mut self.office_room, later.office_room);
        overlay(&mut self.course_ids, later.course_ids);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.name, &newer.name);
        superseded(&mut self.phone, &newer.phone);
        superseded(&mut self.email, &newer.email);
        superseded(&mut self.department, &newer.department);
        superseded(&mut self.office_room, &newer.office_room);
        superseded(&mut self.course_ids, &newer.course_ids);
    }

    fn is_empty(&self) -> bool {
        *self == UpdateTeacherRequest::default()
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        self.course_ids
            .as_mut()
            .is_some_and(|course_ids| remap_all(course_ids, ids))
    }

    fn references_unsynced(&self) -> bool {
        self.course_ids
            .as_ref()
            .is_some_and(|course_ids| course_ids.iter().any(|id| is_temp_id(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_ids_replace_rather_than_append() {
        let input = CreateTeacherRequest {
            name: "Dr. Rahman".to_string(),
            phone: "+8801700000000".to_string(),
            course_ids: vec!["c1".to_string(), "c2".to_string()],
            ..Default::default()
        };
        let mut teacher = Teacher::from_new("th1".to_string(), &input, Utc::now());

        UpdateTeacherRequest {
            course_ids: Some(vec!["c3".to_string()]),
            ..Default::default()
        }
        .apply_to(&mut teacher);

        assert_eq!(teacher.course_ids, vec!["c3".to_string()]);
        assert_eq!(teacher.name, "Dr. Rahman");
    }

    #[test]
    fn test_validation_requires_phone() {
        let input = CreateTeacherRequest {
            name: "Dr. Rahman".to_string(),
            ..Default::default()
        };
        let err = Teacher::validate_new(&input).unwrap_err();
        assert!(err.message().contains("phone"));
    }
}
