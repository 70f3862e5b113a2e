use serde::Serialize;
use std::fmt;

use crate::storage::Newsletter;

/// The kind of data a cache entry holds, independent of its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Entity {
    Newsletters,
    UnreadCount,
    Sources,
    ReadingQueue,
}

/// Structured cache address: entity type plus scope parameters.
///
/// Two newsletter views of the same user are independent entries, and every
/// entry of a user can be found with [`QueryKey::user_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueryKey {
    Newsletters {
        user_id: i64,
        filter: NewsletterFilter,
    },
    UnreadCount {
        user_id: i64,
    },
    Sources {
        user_id: i64,
    },
    ReadingQueue {
        user_id: i64,
    },
}

impl QueryKey {
    pub fn newsletters(user_id: i64, filter: NewsletterFilter) -> Self {
        QueryKey::Newsletters { user_id, filter }
    }

    pub fn unread_count(user_id: i64) -> Self {
        QueryKey::UnreadCount { user_id }
    }

    pub fn sources(user_id: i64) -> Self {
        QueryKey::Sources { user_id }
    }

    pub fn reading_queue(user_id: i64) -> Self {
        QueryKey::ReadingQueue { user_id }
    }

    pub fn entity(&self) -> Entity {
        match self {
            QueryKey::Newsletters { .. } => Entity::Newsletters,
            QueryKey::UnreadCount { .. } => Entity::UnreadCount,
            QueryKey::Sources { .. } => Entity::Sources,
            QueryKey::ReadingQueue { .. } => Entity::ReadingQueue,
        }
    }

    pub fn user_id(&self) -> i64 {
        match *self {
            QueryKey::Newsletters { user_id, .. }
            | QueryKey::UnreadCount { user_id }
            | QueryKey::Sources { user_id }
            | QueryKey::ReadingQueue { user_id } => user_id,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Newsletters { user_id, filter } => {
                write!(f, "newsletters[user={user_id}, {filter}]")
            }
            QueryKey::UnreadCount { user_id } => write!(f, "unread_count[user={user_id}]"),
            QueryKey::Sources { user_id } => write!(f, "sources[user={user_id}]"),
            QueryKey::ReadingQueue { user_id } => write!(f, "reading_queue[user={user_id}]"),
        }
    }
}

/// A newsletter list view.
///
/// `archived: None` means both archived and unarchived newsletters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NewsletterFilter {
    pub archived: Option<bool>,
    pub unread_only: bool,
    pub liked_only: bool,
    pub source_id: Option<i64>,
    pub tag_id: Option<i64>,
}

impl Default for NewsletterFilter {
    fn default() -> Self {
        Self::inbox()
    }
}

impl NewsletterFilter {
    /// Unarchived newsletters.
    pub fn inbox() -> Self {
        Self {
            archived: Some(false),
            ..Self::all()
        }
    }

    /// Archived newsletters.
    pub fn archive() -> Self {
        Self {
            archived: Some(true),
            ..Self::all()
        }
    }

    /// Everything, archived or not.
    pub fn all() -> Self {
        Self {
            archived: None,
            unread_only: false,
            liked_only: false,
            source_id: None,
            tag_id: None,
        }
    }

    pub fn matches(&self, newsletter: &Newsletter) -> bool {
        if let Some(archived) = self.archived {
            if newsletter.is_archived != archived {
                return false;
            }
        }
        if self.unread_only && newsletter.is_read {
            return false;
        }
        if self.liked_only && !newsletter.is_liked {
            return false;
        }
        if let Some(source_id) = self.source_id {
            if newsletter.source_id != Some(source_id) {
                return false;
            }
        }
        if let Some(tag_id) = self.tag_id {
            if !newsletter.has_tag(tag_id) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for NewsletterFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.archived {
            Some(false) => f.write_str("inbox")?,
            Some(true) => f.write_str("archive")?,
            None => f.write_str("all")?,
        }
        if self.unread_only {
            f.write_str(",unread")?;
        }
        if self.liked_only {
            f.write_str(",liked")?;
        }
        if let Some(source_id) = self.source_id {
            write!(f, ",source={source_id}")?;
        }
        if let Some(tag_id) = self.tag_id {
            write!(f, ",tag={tag_id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Tag;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn newsletter(is_read: bool, is_liked: bool, is_archived: bool) -> Newsletter {
        Newsletter {
            id: 1,
            user_id: 1,
            title: Arc::from("Issue"),
            source_id: Some(7),
            is_read,
            is_liked,
            is_archived,
            received_at: 0,
            updated_at: 0,
            tags: vec![Tag {
                id: 3,
                name: Arc::from("rust"),
            }],
        }
    }

    #[test]
    fn test_keys_are_independently_addressable() {
        let keys: HashSet<QueryKey> = [
            QueryKey::newsletters(1, NewsletterFilter::inbox()),
            QueryKey::newsletters(1, NewsletterFilter::archive()),
            QueryKey::unread_count(1),
            QueryKey::unread_count(2),
            QueryKey::sources(1),
            QueryKey::reading_queue(1),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn test_key_accessors() {
        let key = QueryKey::newsletters(9, NewsletterFilter::all());
        assert_eq!(key.entity(), Entity::Newsletters);
        assert_eq!(key.user_id(), 9);
        assert_eq!(QueryKey::reading_queue(4).entity(), Entity::ReadingQueue);
        assert_eq!(QueryKey::sources(4).user_id(), 4);
    }

    #[test]
    fn test_inbox_and_archive_partition() {
        let open = newsletter(false, false, false);
        let archived = newsletter(false, false, true);
        assert!(NewsletterFilter::inbox().matches(&open));
        assert!(!NewsletterFilter::inbox().matches(&archived));
        assert!(NewsletterFilter::archive().matches(&archived));
        assert!(NewsletterFilter::all().matches(&open));
        assert!(NewsletterFilter::all().matches(&archived));
    }

    #[test]
    fn test_narrowing_filters() {
        let read_liked = newsletter(true, true, false);
        let unread = NewsletterFilter {
            unread_only: true,
            ..NewsletterFilter::inbox()
        };
        let liked = NewsletterFilter {
            liked_only: true,
            ..NewsletterFilter::inbox()
        };
        assert!(!unread.matches(&read_liked));
        assert!(liked.matches(&read_liked));

        let by_source = NewsletterFilter {
            source_id: Some(8),
            ..NewsletterFilter::all()
        };
        let by_tag = NewsletterFilter {
            tag_id: Some(3),
            ..NewsletterFilter::all()
        };
        assert!(!by_source.matches(&read_liked));
        assert!(by_tag.matches(&read_liked));
    }

    #[test]
    fn test_display() {
        let key = QueryKey::newsletters(
            1,
            NewsletterFilter {
                unread_only: true,
                source_id: Some(2),
                ..NewsletterFilter::inbox()
            },
        );
        assert_eq!(key.to_string(), "newsletters[user=1, inbox,unread,source=2]");
    }
}
