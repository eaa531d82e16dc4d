//! Task model matching the web client's Task interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{overlay, require, superseded, Entity, EntityKind, Patch};
use crate::errors::SyncError;

/// Progress of a task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    MyTasks,
    InProgress,
    Completed,
}

/// A task owned by a single user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub due_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_admin_task: bool,
    pub created_at: String,
}

/// Request body for creating a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub due_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Filled from the repository's owner scope when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_admin_task: bool,
}

/// Request body for updating an existing task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl Entity for Task {
    type New = CreateTaskRequest;
    type Patch = UpdateTaskRequest;

    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn assign_owner(input: &mut CreateTaskRequest, owner: &str) {
        if input.user_id.is_none() {
            input.user_id = Some(owner.to_string());
        }
    }

    fn validate_new(input: &CreateTaskRequest) -> Result<(), SyncError> {
        require(&input.name, "name", "Task")?;
        require(&input.due_date, "dueDate", "Task")
    }

    fn from_new(id: String, input: &CreateTaskRequest, now: DateTime<Utc>) -> Self {
        Task {
            id,
            name: input.name.clone(),
            category: input.category.clone(),
            due_date: input.due_date.clone(),
            description: input.description.clone(),
            status: input.status,
            user_id: input.user_id.clone(),
            is_admin_task: input.is_admin_task,
            created_at: now.to_rfc3339(),
        }
    }

    fn to_new(&self) -> CreateTaskRequest {
        CreateTaskRequest {
            name: self.name.clone(),
            category: self.category.clone(),
            due_date: self.due_date.clone(),
            description: self.description.clone(),
            status: self.status,
            user_id: self.user_id.clone(),
            is_admin_task: self.is_admin_task,
        }
    }
}

impl Patch<Task> for UpdateTaskRequest {
    fn apply_to(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(category) = &self.category {
            task.category = category.clone();
        }
        if let Some(due_date) = &self.due_date {
            task.due_date = due_date.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.name, later.name);
        overlay(&mut self.category, later.category);
        overlay(&mut self.due_date, later.due_date);
        overlay(&mut self.description, later.description);
        overlay(&mut self.status, later.status);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.name, &newer.name);
        superseded(&mut self.category, &newer.category);
        superseded(&mut self.due_date, &newer.due_date);
        superseded(&mut self.description, &newer.description);
        superseded(&mut self.status, &newer.status);
    }

    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.due_date.is_none()
            && self.description.is_none()
            && self.status.is_none()
    }
}
