mod newsletters;
mod queue;
mod schema;
mod sources;
mod tags;
mod types;

pub use schema::Database;
pub use types::{
    DatabaseError, NewNewsletter, Newsletter, NewsletterFields, QueueEntry, QueuePosition, Source,
    Tag,
};
