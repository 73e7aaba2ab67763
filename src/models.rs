//! Domain Models - Synchronizable Entities
//!
//! Every entity the app edits offline implements [`SyncEntity`]:
//! - Task, Sprint, Goal
//! - DailyCheckup, DayActivity
//! - Notification
//! - ActivityCategory, Tag
//!
//! Each entity embeds an [`EntityMeta`] (id, owner, timestamps) flattened into
//! its JSON so the sync layer can handle all types uniformly.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity Contract
// ============================================================================

/// Sync metadata shared by every entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Client-generated UUID, stable for the entity's lifetime
    #[serde(default)]
    pub id: String,

    /// Authenticated user that owns the entity
    #[serde(default)]
    pub owner_id: String,

    /// Milliseconds since epoch, set once at creation
    #[serde(default)]
    pub created_at: i64,

    /// Milliseconds since epoch, set by whichever side wrote last
    #[serde(default)]
    pub updated_at: i64,
}

/// An entity that can be stored locally and synchronized remotely
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entity type tag; doubles as the remote table name
    const ENTITY_TYPE: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> &str {
        &self.meta().id
    }
}

macro_rules! impl_sync_entity {
    ($ty:ty, $tag:literal) => {
        impl SyncEntity for $ty {
            const ENTITY_TYPE: &'static str = $tag;

            fn meta(&self) -> &EntityMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut EntityMeta {
                &mut self.meta
            }
        }
    };
}

/// Every entity type the coordinator knows how to sync
pub const ALL_ENTITY_TYPES: [&str; 8] = [
    Task::ENTITY_TYPE,
    Sprint::ENTITY_TYPE,
    Goal::ENTITY_TYPE,
    DailyCheckup::ENTITY_TYPE,
    Notification::ENTITY_TYPE,
    ActivityCategory::ENTITY_TYPE,
    Tag::ENTITY_TYPE,
    DayActivity::ENTITY_TYPE,
];

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Mark the task done at `now` (ms since epoch)
    pub fn mark_done(&mut self, now: i64) {
        self.status = TaskStatus::Done;
        self.completed_at = Some(now);
    }

    /// Reopen a completed task
    pub fn reopen(&mut self) {
        self.status = TaskStatus::Todo;
        self.completed_at = None;
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

impl_sync_entity!(Task, "tasks");

// ============================================================================
// Sprints & Goals
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    #[default]
    Planned,
    Active,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    #[serde(default)]
    pub goal: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: SprintStatus,
}

impl Sprint {
    pub fn new(name: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            name: name.into(),
            start_date: Some(start_date),
            end_date: Some(end_date),
            ..Default::default()
        }
    }

    /// Whether `day` falls inside the sprint window (inclusive)
    pub fn contains(&self, day: NaiveDate) -> bool {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => start <= day && day <= end,
            _ => false,
        }
    }
}

impl_sync_entity!(Sprint, "sprints");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    #[default]
    Active,
    Achieved,
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    /// Percent complete, 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub status: GoalStatus,
}

impl Goal {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        if self.progress == 100 {
            self.status = GoalStatus::Achieved;
        }
    }
}

impl_sync_entity!(Goal, "goals");

// ============================================================================
// Daily Tracking
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCheckup {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub date: Option<NaiveDate>,
    /// 1-5
    #[serde(default)]
    pub mood: Option<u8>,
    /// 1-5
    #[serde(default)]
    pub energy: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl_sync_entity!(DailyCheckup, "daily_checkups");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayActivity {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub duration_minutes: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl_sync_entity!(DayActivity, "day_activities");

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    /// When to deliver, ms since epoch
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub read: bool,
}

impl_sync_entity!(Notification, "notifications");

// ============================================================================
// Categories & Tags
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityCategory {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    /// Hex color, e.g. "#4f46e5"
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

impl_sync_entity!(ActivityCategory, "activity_categories");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl_sync_entity!(Tag, "tags");

// ============================================================================
// Tests
// ============================================================================
