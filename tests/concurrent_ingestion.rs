mod common;

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use common::{Fixture, note, reply};
use weave::{
    Activity, ActivityMaterializer, ActivityObject, ActivityType, Database, EngineConfig,
    NoteData, RetryPolicy,
};

const WORKERS: usize = 4;
const REPLIES: usize = 10;

/// Retries generously: four writers share one lock.
fn contended_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            attempts: 100,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        },
        ..EngineConfig::default()
    }
}

/// A root note, replies to it by distinct authors, and a like of every reply.
fn workload(f: &Fixture) -> Vec<Activity> {
    let mut activities = vec![f.create(note("root", "alice", "root post", 1))];
    for i in 0..REPLIES {
        let name = format!("reply-{i}");
        activities.push(f.create(reply(
            note(&name, &format!("user{i}"), "a reply", 10 + i as i64),
            "root",
        )));
        activities.push(f.activity(
            ActivityType::Like,
            "alice",
            ActivityObject::Note(NoteData::reference(common::note_oid(&name))),
        ));
    }
    activities
}

#[test]
fn test_parallel_workers_ingesting_overlapping_streams_create_no_duplicates() -> Result<()> {
    // Arrange: migrate once, then one connection per worker
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weave.db");
    let f = Fixture::with_database(Database::open(&path)?, contended_config())?;
    let activities = workload(&f);
    let workers = (0..WORKERS)
        .map(|_| Database::open(&path))
        .collect::<Result<Vec<_>>>()?;

    // Act: every worker sees the whole stream, rotated so they start at different points
    let reports = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .enumerate()
            .map(|(i, db)| {
                let config = f.config.clone();
                let account = f.account;
                let mut stream = activities.clone();
                let shift = i * stream.len() / WORKERS;
                stream.rotate_left(shift);
                scope.spawn(move || {
                    let mut materializer = ActivityMaterializer::new(&db, config);
                    materializer.materialize_batch(&account, &stream, &AtomicBool::new(false))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect::<Vec<_>>()
    });

    // Assert
    for report in &reports {
        assert_eq!(report.failed, 0, "{report:?}");
        assert_eq!(report.processed, activities.len());
    }
    assert_eq!(f.count("SELECT COUNT(*) FROM notes")?, 1 + REPLIES as i64);
    assert_eq!(
        f.count(
            "SELECT COUNT(*) FROM (SELECT origin_id, actor_oid FROM actors
             WHERE actor_oid IS NOT NULL GROUP BY origin_id, actor_oid HAVING COUNT(*) > 1)"
        )?,
        0
    );
    // me, alice, and one author per reply
    assert_eq!(
        f.count("SELECT COUNT(*) FROM actors WHERE group_type = 0")?,
        2 + REPLIES as i64
    );
    assert_eq!(f.count("SELECT COUNT(*) FROM activities")?, activities.len() as i64);

    let root = f.note_id("root")?.unwrap();
    assert_eq!(
        f.count(&format!(
            "SELECT COUNT(*) FROM notes WHERE conversation_id != {}",
            root.get()
        ))?,
        0
    );
    assert_eq!(
        f.count("SELECT COUNT(*) FROM note_relations WHERE favorited = 1")?,
        REPLIES as i64
    );
    Ok(())
}
