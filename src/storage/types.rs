use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of letterbox appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// message text through sqlx.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for newsletter queries (used by sqlx FromRow).
/// Tags live in a join table and are attached afterwards.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NewsletterDbRow {
    pub id: i64,
    pub user_id: i64,
    pub source_id: Option<i64>,
    pub title: String,
    pub is_read: bool,
    pub is_liked: bool,
    pub is_archived: bool,
    pub received_at: i64,
    pub updated_at: i64,
}

impl NewsletterDbRow {
    pub(crate) fn into_newsletter(self, tags: Vec<Tag>) -> Newsletter {
        Newsletter {
            id: self.id,
            user_id: self.user_id,
            title: Arc::from(self.title),
            source_id: self.source_id,
            is_read: self.is_read,
            is_liked: self.is_liked,
            is_archived: self.is_archived,
            received_at: self.received_at,
            updated_at: self.updated_at,
            tags,
        }
    }
}

/// Row type for the source count query
pub(crate) type SourceRow = (i64, i64, String, i64);

// ============================================================================
// Data Structures
// ============================================================================

/// A newsletter as owned by the store.
///
/// Cached copies are replaced wholesale, never edited in place: use
/// [`Newsletter::with_fields`] to derive the post-mutation value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Newsletter {
    pub id: i64,
    pub user_id: i64,
    pub title: Arc<str>,
    pub source_id: Option<i64>,
    pub is_read: bool,
    pub is_liked: bool,
    pub is_archived: bool,
    /// Unix timestamp (seconds)
    pub received_at: i64,
    /// Unix timestamp (seconds)
    pub updated_at: i64,
    pub tags: Vec<Tag>,
}

impl Newsletter {
    /// Return a copy with `fields` applied and `updated_at` bumped.
    pub fn with_fields(&self, fields: &NewsletterFields) -> Self {
        Self {
            is_read: fields.is_read.unwrap_or(self.is_read),
            is_liked: fields.is_liked.unwrap_or(self.is_liked),
            is_archived: fields.is_archived.unwrap_or(self.is_archived),
            updated_at: chrono::Utc::now().timestamp().max(self.updated_at),
            ..self.clone()
        }
    }

    /// Return a copy carrying `tags` instead of the current set.
    pub fn with_tags(&self, tags: Vec<Tag>) -> Self {
        Self {
            tags,
            updated_at: chrono::Utc::now().timestamp().max(self.updated_at),
            ..self.clone()
        }
    }

    pub fn has_tag(&self, tag_id: i64) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }
}

/// Partial field update for a newsletter. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewsletterFields {
    pub is_read: Option<bool>,
    pub is_liked: Option<bool>,
    pub is_archived: Option<bool>,
}

impl NewsletterFields {
    pub fn read(is_read: bool) -> Self {
        Self {
            is_read: Some(is_read),
            ..Self::default()
        }
    }

    pub fn liked(is_liked: bool) -> Self {
        Self {
            is_liked: Some(is_liked),
            ..Self::default()
        }
    }

    pub fn archived(is_archived: bool) -> Self {
        Self {
            is_archived: Some(is_archived),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_read.is_none() && self.is_liked.is_none() && self.is_archived.is_none()
    }
}

/// Newsletter to insert through the storage helpers (seeding and tests).
#[derive(Debug, Clone)]
pub struct NewNewsletter {
    pub title: String,
    pub source_id: Option<i64>,
    pub received_at: i64,
}

/// A newsletter source with its derived count of non-archived newsletters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub id: i64,
    pub user_id: i64,
    pub name: Arc<str>,
    pub newsletter_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Tag {
    pub id: i64,
    pub name: Arc<str>,
}

/// One row of a user's reading queue.
///
/// Entries order by `position`, ties broken by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub user_id: i64,
    pub newsletter_id: i64,
    pub position: i64,
}

impl QueueEntry {
    /// Entries created optimistically carry a negative id until the store
    /// returns the real row.
    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }
}

/// `(id, position)` pair submitted to an atomic reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    pub id: i64,
    pub position: i64,
}
