mod support;

use podcast_core::episode::{EpisodeStatus, PodcastDraft};
use rusqlite::Connection;

use support::{draft, Harness, SOURCE_ID};

#[test]
fn batched_updates_skip_archived_rows() {
    let harness = Harness::new();
    let (first, second) = harness.seed_sibling_episodes();

    // archive the second sibling by hand
    let conn = Connection::open(harness.config.database_path()).unwrap();
    conn.execute(
        "UPDATE episodes SET status = 'archived' WHERE id = ?1",
        [second],
    )
    .unwrap();

    let affected = harness
        .store
        .set_status(SOURCE_ID, EpisodeStatus::Downloading)
        .unwrap();
    assert_eq!(affected, 1);

    assert_eq!(
        harness.store.fetch_episode(first).unwrap().status,
        EpisodeStatus::Downloading
    );
    assert_eq!(
        harness.store.fetch_episode(second).unwrap().status,
        EpisodeStatus::Archived
    );

    let siblings = harness.store.siblings(SOURCE_ID).unwrap();
    assert_eq!(siblings.len(), 1);
    assert_eq!(siblings[0].id, first);
}

#[test]
fn mark_published_is_idempotent_on_timestamp() {
    let harness = Harness::new();
    let (first, _) = harness.seed_sibling_episodes();

    harness.store.mark_published(SOURCE_ID, 1234).unwrap();
    let original = harness.store.fetch_episode(first).unwrap();
    assert_eq!(original.status, EpisodeStatus::Published);
    assert_eq!(original.file_size, 1234);
    let first_publish = original.published_at.expect("published_at set");

    harness.store.mark_published(SOURCE_ID, 5678).unwrap();
    let republished = harness.store.fetch_episode(first).unwrap();
    assert_eq!(republished.file_size, 5678);
    assert_eq!(republished.published_at, Some(first_publish));
}

#[test]
fn mark_error_zeroes_file_size() {
    let harness = Harness::new();
    let (first, second) = harness.seed_sibling_episodes();

    harness.store.mark_published(SOURCE_ID, 999).unwrap();
    harness.store.mark_error(SOURCE_ID).unwrap();

    for episode_id in [first, second] {
        let episode = harness.store.fetch_episode(episode_id).unwrap();
        assert_eq!(episode.status, EpisodeStatus::Error);
        assert_eq!(episode.file_size, 0);
    }
}

#[test]
fn unknown_status_is_an_error_not_new() {
    let harness = Harness::new();
    let (first, _) = harness.seed_sibling_episodes();

    let conn = Connection::open(harness.config.database_path()).unwrap();
    conn.execute(
        "UPDATE episodes SET status = 'bogus' WHERE id = ?1",
        [first],
    )
    .unwrap();

    let err = harness.store.fetch_episode(first).unwrap_err();
    assert!(err.to_string().contains("bogus"), "got: {err}");
}

#[test]
fn podcast_ids_fan_out_over_every_registration() {
    let harness = Harness::new();
    harness.seed_sibling_episodes();

    let third = harness
        .store
        .create_podcast(&PodcastDraft::new("Night Show"))
        .unwrap();
    harness.store.create_episode(&draft(third)).unwrap();

    let mut ids = harness.store.podcast_ids_for_source(SOURCE_ID).unwrap();
    ids.sort_unstable();
    assert_eq!(ids.len(), 3);
}

#[test]
fn file_sharing_counts_other_active_rows() {
    let harness = Harness::new();
    let (first, second) = harness.seed_sibling_episodes();
    let file_name = harness
        .store
        .fetch_episode(first)
        .unwrap()
        .file_name
        .unwrap();

    assert!(harness.store.is_file_shared(&file_name, first).unwrap());

    let conn = Connection::open(harness.config.database_path()).unwrap();
    conn.execute(
        "UPDATE episodes SET status = 'archived' WHERE id = ?1",
        [second],
    )
    .unwrap();
    assert!(!harness.store.is_file_shared(&file_name, first).unwrap());
}
