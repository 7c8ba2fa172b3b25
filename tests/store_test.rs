mod helpers;

use helpers::{draft, seed_session, test_db};
use mnemo::memory::observations::{
    get_observations_by_ids, store_observations, ObservationFilter,
};
use mnemo::memory::sessions::assign_memory_session_id;
use mnemo::memory::types::{ObservationType, SummaryDraft};
use mnemo::memory::search::search_observations;

#[test]
fn batch_store_is_atomic_and_readable() {
    let mut conn = test_db();
    let sid = seed_session(&conn, "s1", "demo");

    let result = store_observations(
        &mut conn,
        sid,
        "mem-1",
        "demo",
        &[
            draft("first finding", ObservationType::Discovery),
            draft("second finding", ObservationType::Decision),
        ],
        Some(&SummaryDraft {
            request: "investigate the flake".into(),
            ..Default::default()
        }),
        Some(1_700_000_000_000),
    )
    .unwrap();

    // All ids visible, plus the summary
    assert_eq!(result.observation_ids.len(), 2);
    assert!(result.summary_id.is_some());

    let rows = get_observations_by_ids(&conn, &result.observation_ids).unwrap();
    assert_eq!(rows.len(), 2);

    // FTS rows committed in the same transaction
    let page = search_observations(
        &conn,
        "finding",
        &ObservationFilter::default(),
        0,
        10,
    )
    .unwrap();
    assert_eq!(page.results.len(), 2);
}

#[test]
fn event_epoch_survives_delayed_processing() {
    let mut conn = test_db();
    let sid = seed_session(&conn, "s1", "demo");

    // The agent finished much later than the event happened; the stored
    // record must carry the event time.
    let event_epoch = 1_600_000_000_000;
    let result = store_observations(
        &mut conn,
        sid,
        "mem-1",
        "demo",
        &[draft("delayed", ObservationType::Change)],
        None,
        Some(event_epoch),
    )
    .unwrap();

    assert_eq!(result.created_at_epoch, event_epoch);
    let rows = get_observations_by_ids(&conn, &result.observation_ids).unwrap();
    assert_eq!(rows[0].created_at_epoch, event_epoch);
}

#[test]
fn memory_session_id_is_write_once() {
    let conn = test_db();
    let sid = seed_session(&conn, "s1", "demo");

    assert_eq!(assign_memory_session_id(&conn, sid, "mem-a").unwrap(), "mem-a");
    // Later assignments (e.g. a fallback agent racing) never overwrite
    assert_eq!(assign_memory_session_id(&conn, sid, "mem-b").unwrap(), "mem-a");
    assert_eq!(assign_memory_session_id(&conn, sid, "mem-c").unwrap(), "mem-a");
}

#[test]
fn every_observation_references_its_session() {
    let mut conn = test_db();
    let sid = seed_session(&conn, "s1", "demo");
    let result = store_observations(
        &mut conn,
        sid,
        "mem-1",
        "demo",
        &[draft("linked", ObservationType::Discovery)],
        None,
        None,
    )
    .unwrap();

    let (obs_session, exists): (i64, bool) = conn
        .query_row(
            "SELECT o.session_id, EXISTS(SELECT 1 FROM sessions s WHERE s.id = o.session_id)
             FROM observations o WHERE o.id = ?1",
            [result.observation_ids[0]],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(obs_session, sid);
    assert!(exists);
}
