use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use letterbox::cache::NewsletterFilter;
use letterbox::config::{Config, USER_ID_ENV};
use letterbox::engine::{Engine, MutationReport, ReorderOutcome};
use letterbox::storage::{Database, DatabaseError, NewNewsletter, Newsletter, Tag};
use letterbox::util::{strip_control_chars, truncate_to_width};

/// Get the config directory path (~/.config/letterbox/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("letterbox"))
}

#[derive(Parser, Debug)]
#[command(name = "letterbox", about = "Newsletter triage from the terminal")]
struct Args {
    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List newsletters (inbox by default)
    List {
        /// Only archived newsletters
        #[arg(long, conflicts_with = "all")]
        archived: bool,
        /// Archived and unarchived newsletters
        #[arg(long)]
        all: bool,
        #[arg(long)]
        unread: bool,
        #[arg(long)]
        liked: bool,
        #[arg(long, value_name = "ID")]
        source: Option<i64>,
        #[arg(long, value_name = "ID")]
        tag: Option<i64>,
    },
    /// Show the unread counter and per-source counts
    Counts,
    /// Mark newsletters read
    Read {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Mark newsletters unread
    Unread {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Toggle the like flag
    Like { id: i64 },
    Archive {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    Unarchive {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Permanently delete newsletters
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Show the reading queue
    Queue,
    /// Append a newsletter to the reading queue
    QueueAdd { id: i64 },
    /// Remove a newsletter from the reading queue
    QueueRemove { id: i64 },
    /// Reorder the reading queue; lists every entry id in the new order
    Reorder {
        #[arg(required = true)]
        entry_ids: Vec<i64>,
    },
    /// Replace the tags of a newsletter
    Tag { id: i64, tag_ids: Vec<i64> },
    /// Insert demo data
    Seed,
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn print_report(json: bool, report: &MutationReport) -> Result<()> {
    emit(json, report, |r| {
        if r.persisted {
            println!("Updated {} newsletter(s), unread {:+}", r.matched, r.unread_delta);
        } else {
            println!("Nothing changed: the newsletter no longer exists");
        }
    })
}

fn print_newsletters(list: &[Newsletter], title_width: usize) {
    if list.is_empty() {
        println!("No newsletters.");
        return;
    }
    for n in list {
        let flags = format!(
            "{}{}{}",
            if n.is_read { ' ' } else { '*' },
            if n.is_liked { '♥' } else { ' ' },
            if n.is_archived { 'A' } else { ' ' },
        );
        let title = strip_control_chars(&n.title);
        let tags: Vec<&str> = n.tags.iter().map(|t| t.name.as_ref()).collect();
        println!(
            "{:>6} {} {:<width$} {}",
            n.id,
            flags,
            truncate_to_width(&title, title_width),
            tags.join(","),
            width = title_width
        );
    }
}

async fn seed(db: &Database, user_id: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let weekly = db.insert_source(user_id, "Rust Weekly").await?;
    let digest = db.insert_source(user_id, "Systems Digest").await?;
    let rust = db.create_tag(user_id, "rust").await?;
    let later = db.create_tag(user_id, "later").await?;

    let samples = [
        ("This Week in Async", Some(weekly)),
        ("Ownership Patterns, Part 3", Some(weekly)),
        ("Kernel Bypass in Practice", Some(digest)),
        ("Storage Engines Compared", Some(digest)),
        ("Welcome to letterbox", None),
    ];
    let mut ids = Vec::with_capacity(samples.len());
    for (offset, (title, source_id)) in (0..).zip(samples) {
        let id = db
            .insert_newsletter(
                user_id,
                &NewNewsletter {
                    title: title.to_string(),
                    source_id,
                    received_at: now - offset * 3600,
                },
            )
            .await?;
        ids.push(id);
    }
    db.set_newsletter_tags(user_id, ids[0], &[rust]).await?;
    db.set_newsletter_tags(user_id, ids[1], &[rust, later]).await?;
    for (position, &id) in (0..).zip(&ids[2..4]) {
        db.insert_queue_entry(user_id, id, position).await?;
    }
    println!("Seeded {} newsletters for user {}", ids.len(), user_id);
    Ok(())
}

/// Load every view a mutation may touch, so optimistic deltas have
/// something to apply to.
async fn prime(engine: &Engine<Database>) -> Result<()> {
    engine.newsletters(NewsletterFilter::all()).await?;
    engine.unread_count().await?;
    engine.sources().await?;
    engine.reading_queue().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    let config = Config::load(&config_dir.join("config.toml"))
        .context("Failed to load config")?
        .with_user_override(std::env::var(USER_ID_ENV).ok().as_deref())?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("letterbox.db"));
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of letterbox appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let user_id = config.user_id;
    if let Command::Seed = args.command {
        return seed(&db, user_id).await;
    }

    let engine = Engine::new(Arc::new(db), config.engine_config());
    engine.sign_in(user_id);
    prime(&engine).await?;
    let json = args.json;

    let report = match args.command {
        Command::List {
            archived,
            all,
            unread,
            liked,
            source,
            tag,
        } => {
            let base = if all {
                NewsletterFilter::all()
            } else if archived {
                NewsletterFilter::archive()
            } else {
                NewsletterFilter::inbox()
            };
            let filter = NewsletterFilter {
                unread_only: unread,
                liked_only: liked,
                source_id: source,
                tag_id: tag,
                ..base
            };
            let list = engine.newsletters(filter).await?;
            return emit(json, &*list, |l| print_newsletters(l, config.title_width));
        }
        Command::Counts => {
            #[derive(Serialize)]
            struct Counts {
                unread: i64,
                sources: Vec<letterbox::storage::Source>,
            }
            let counts = Counts {
                unread: engine.unread_count().await?,
                sources: engine.sources().await?.to_vec(),
            };
            return emit(json, &counts, |c| {
                println!("Unread: {}", c.unread);
                for s in &c.sources {
                    println!("{:>6} {:<30} {}", s.id, strip_control_chars(&s.name), s.newsletter_count);
                }
            });
        }
        Command::Queue => {
            let queue = engine.reading_queue().await?;
            return emit(json, &*queue, |q| {
                if q.is_empty() {
                    println!("Reading queue is empty.");
                }
                for e in q {
                    println!("{:>3}. entry {:>5} newsletter {}", e.position, e.id, e.newsletter_id);
                }
            });
        }
        Command::Read { ids } => match ids.as_slice() {
            [id] => engine.mark_read(*id).await?,
            _ => engine.mark_read_bulk(&ids).await?,
        },
        Command::Unread { ids } => match ids.as_slice() {
            [id] => engine.mark_unread(*id).await?,
            _ => engine.mark_unread_bulk(&ids).await?,
        },
        Command::Like { id } => engine.toggle_like(id).await?,
        Command::Archive { ids } => match ids.as_slice() {
            [id] => engine.archive(*id).await?,
            _ => engine.archive_bulk(&ids).await?,
        },
        Command::Unarchive { ids } => match ids.as_slice() {
            [id] => engine.unarchive(*id).await?,
            _ => engine.unarchive_bulk(&ids).await?,
        },
        Command::Delete { ids } => match ids.as_slice() {
            [id] => engine.delete(*id).await?,
            _ => engine.delete_bulk(&ids).await?,
        },
        Command::QueueAdd { id } => engine.add_to_queue(id).await?,
        Command::QueueRemove { id } => engine.remove_from_queue(id).await?,
        Command::Reorder { entry_ids } => {
            let outcome = engine.reorder_queue(&entry_ids).await?;
            engine.settle().await?;
            return match outcome {
                ReorderOutcome::Applied(positions) => emit(json, &positions, |p| {
                    println!("Reordered {} queue entries", p.len());
                }),
                ReorderOutcome::Superseded => {
                    println!("Reorder superseded");
                    Ok(())
                }
            };
        }
        Command::Tag { id, tag_ids } => {
            let known = engine.remote().get_tags(user_id).await?;
            let tags = tag_ids
                .iter()
                .map(|tag_id| {
                    known
                        .iter()
                        .find(|t| t.id == *tag_id)
                        .cloned()
                        .with_context(|| format!("Unknown tag {tag_id}"))
                })
                .collect::<Result<Vec<Tag>>>()?;
            engine.update_tags(id, tags).await?
        }
        Command::Seed => bail!("seed is handled before the engine starts"),
    };

    engine.settle().await?;
    print_report(json, &report)
}
