use crate::db::{DELTA_CURRENT, DELTA_NEW, DELTA_REMOVED};
use crate::reconcile::{self, PassStats};
use crate::snapshot::{self, ParsedSnapshot};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;

#[derive(Debug)]
pub enum UploadError {
    /// Caller lacks rights over the organization; nothing was written.
    Forbidden(String),
    /// The organization exists but scheduling uploads are switched off.
    SchedulingDisabled(String),
    /// Malformed payload; nothing was written.
    Validation(Vec<String>),
    /// A write failed; the transaction rolled the whole pass back.
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for UploadError {
    fn from(e: rusqlite::Error) -> Self {
        UploadError::Db(e)
    }
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub snapshot_id: String,
    pub pass_stamp: String,
    pub first_import: bool,
    pub stats: PassStats,
    pub pruned_snapshots: usize,
    pub deleted_bookings: usize,
    pub deleted_participants: usize,
    pub linked_events: usize,
}

/// Full upload pass: authorize, validate, store the snapshot, reconcile
/// against the previous one, prune same-day snapshots and cascade cleanup.
/// The whole pass runs inside one transaction; the first failing write rolls
/// everything back, so a caller never observes a half-applied pass.
pub fn upload(
    conn: &Connection,
    org_id: &str,
    actor_role: &str,
    raw_payload: &serde_json::Value,
) -> Result<UploadOutcome, UploadError> {
    let enabled: Option<i64> = conn
        .query_row(
            "SELECT scheduling_enabled FROM organizations WHERE id = ?",
            [org_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(enabled) = enabled else {
        return Err(UploadError::Forbidden(format!(
            "unknown organization {}",
            org_id
        )));
    };
    if actor_role != "scheduler" && actor_role != "admin" {
        return Err(UploadError::Forbidden(format!(
            "role '{}' may not upload schedules",
            actor_role
        )));
    }
    if enabled == 0 {
        return Err(UploadError::SchedulingDisabled(format!(
            "scheduling is disabled for organization {}",
            org_id
        )));
    }

    let snap = snapshot::validate_payload(raw_payload).map_err(UploadError::Validation)?;
    let stamp = snap.pass_stamp();

    let tx = conn.unchecked_transaction()?;

    let snapshot_id = snapshot::store(&tx, org_id, &snap)?;
    let prior = snapshot::prior_snapshots(&tx, org_id, &snap.term_id, &snapshot_id)?;
    let first_import = prior.is_empty();
    if first_import {
        // No reference snapshot to diff against. Stamp the whole scope as
        // confirmed-current so the pass cannot produce a mass `removed`
        // storm for rows that simply predate the export coverage.
        baseline_reset(&tx, org_id, &snap.term_id, &stamp)?;
    }

    let pass = reconcile::run_pass(&tx, org_id, &snap, &stamp)?;

    let pruned_snapshots =
        snapshot::prune_same_day(&tx, org_id, &snap.term_id, &snap.creation_date, &snapshot_id)?;
    let deleted_bookings = cleanup_bookings(&tx, org_id, &snap.term_id, &snap.creation_date)?;
    let deleted_participants = cleanup_participants(&tx, org_id, &snap.term_id)?;
    // Advisory only: a failure here must not sink an otherwise good pass.
    let linked_events = link_new_events(&tx, org_id, &snap.term_id).unwrap_or(0);

    tx.commit()?;

    Ok(UploadOutcome {
        snapshot_id,
        pass_stamp: stamp,
        first_import,
        stats: pass.stats,
        pruned_snapshots,
        deleted_bookings,
        deleted_participants,
        linked_events,
    })
}

/// One-time reset on first import: every delta-tagged row in (org, term)
/// scope becomes confirmed-current at the pass stamp.
fn baseline_reset(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
    stamp: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE units SET delta = ?, modified = ? WHERE org_id = ? AND term_id = ?",
        (DELTA_CURRENT, stamp, org_id, term_id),
    )?;
    conn.execute(
        "UPDATE instances SET delta = ?, modified = ?
         WHERE unit_id IN (SELECT id FROM units WHERE org_id = ? AND term_id = ?)",
        (DELTA_CURRENT, stamp, org_id, term_id),
    )?;
    conn.execute(
        "UPDATE instance_persons SET delta = ?, modified = ?
         WHERE instance_id IN (
            SELECT i.id FROM instances i
            JOIN units u ON u.id = i.unit_id
            WHERE u.org_id = ? AND u.term_id = ?)",
        (DELTA_CURRENT, stamp, org_id, term_id),
    )?;
    for table in ["instance_groups", "instance_rooms"] {
        let sql = format!(
            "UPDATE {} SET delta = ?, modified = ?
             WHERE assoc_id IN (
                SELECT ip.id FROM instance_persons ip
                JOIN instances i ON i.id = ip.instance_id
                JOIN units u ON u.id = i.unit_id
                WHERE u.org_id = ? AND u.term_id = ?)",
            table
        );
        conn.execute(&sql, (DELTA_CURRENT, stamp, org_id, term_id))?;
    }
    Ok(())
}

/// Deletes bookings that lost every non-removed instance for their
/// (unit, block), plus past bookings nobody ever checked in to.
fn cleanup_bookings(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
    today: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM booking_checkins
         WHERE booking_id IN (
            SELECT b.id FROM bookings b
            JOIN units u ON u.id = b.unit_id
            WHERE u.org_id = ? AND u.term_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM instances i
                WHERE i.unit_id = b.unit_id
                  AND i.block_id = b.block_id
                  AND i.delta != ?))",
        (org_id, term_id, DELTA_REMOVED),
    )?;
    let mut deleted = conn.execute(
        "DELETE FROM bookings
         WHERE unit_id IN (SELECT id FROM units WHERE org_id = ? AND term_id = ?)
           AND NOT EXISTS (
             SELECT 1 FROM instances i
             WHERE i.unit_id = bookings.unit_id
               AND i.block_id = bookings.block_id
               AND i.delta != ?)",
        (org_id, term_id, DELTA_REMOVED),
    )?;
    deleted += conn.execute(
        "DELETE FROM bookings
         WHERE unit_id IN (SELECT id FROM units WHERE org_id = ? AND term_id = ?)
           AND (SELECT b.date FROM blocks b WHERE b.id = bookings.block_id) < ?
           AND NOT EXISTS (
             SELECT 1 FROM booking_checkins c WHERE c.booking_id = bookings.id)",
        (org_id, term_id, today),
    )?;
    Ok(deleted)
}

/// Registrations pointing at removed instances are hard-deleted; the
/// instance row itself keeps its `removed` flag for change highlighting.
fn cleanup_participants(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM instance_participants
         WHERE instance_id IN (
            SELECT i.id FROM instances i
            JOIN units u ON u.id = i.unit_id
            WHERE u.org_id = ? AND u.term_id = ? AND i.delta = ?)",
        (org_id, term_id, DELTA_REMOVED),
    )
}

/// Best-effort: link events newly observed this pass to a curricular subject
/// whose code matches, searching the curriculum subtree reachable from the
/// event's groups. Ambiguity resolves to the smallest subject id.
fn link_new_events(conn: &Connection, org_id: &str, term_id: &str) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e.id, e.code FROM events e
         JOIN instances i ON i.event_id = e.id
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ? AND u.term_id = ? AND i.delta = ? AND e.subject_id IS NULL",
    )?;
    let candidates = stmt
        .query_map((org_id, term_id, DELTA_NEW), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut linked = 0;
    for (event_id, code) in candidates {
        let start = event_groups(conn, &event_id)?;
        if start.is_empty() {
            continue;
        }
        let reachable = reachable_groups(conn, &start)?;

        let mut stmt = conn.prepare(
            "SELECT id, group_id FROM subjects WHERE code = ? ORDER BY id",
        )?;
        let subjects = stmt
            .query_map([&code], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let Some((subject_id, _)) = subjects
            .into_iter()
            .find(|(_, group_id)| reachable.contains(group_id))
        else {
            continue;
        };
        linked += conn.execute(
            "UPDATE events SET subject_id = ? WHERE id = ? AND subject_id IS NULL",
            (&subject_id, &event_id),
        )?;
    }
    Ok(linked)
}

/// Groups currently attached (non-removed) to any lecturer of the event.
fn event_groups(conn: &Connection, event_id: &str) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT g.group_id FROM instance_groups g
         JOIN instance_persons ip ON ip.id = g.assoc_id
         JOIN instances i ON i.id = ip.instance_id
         WHERE i.event_id = ? AND g.delta != ? AND ip.delta != ?",
    )?;
    let ids = stmt
        .query_map((event_id, DELTA_REMOVED, DELTA_REMOVED), |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

/// Ancestors plus descendants of the given curriculum nodes.
fn reachable_groups(
    conn: &Connection,
    start: &BTreeSet<String>,
) -> rusqlite::Result<BTreeSet<String>> {
    let mut reachable: BTreeSet<String> = start.clone();

    for group_id in start {
        let mut cursor = group_id.clone();
        loop {
            let parent: Option<Option<String>> = conn
                .query_row(
                    "SELECT parent_id FROM study_groups WHERE id = ?",
                    [&cursor],
                    |r| r.get(0),
                )
                .optional()?;
            match parent.flatten() {
                Some(p) => {
                    if !reachable.insert(p.clone()) {
                        break;
                    }
                    cursor = p;
                }
                None => break,
            }
        }
    }

    let mut queue: Vec<String> = reachable.iter().cloned().collect();
    while let Some(group_id) = queue.pop() {
        let mut stmt = conn.prepare("SELECT id FROM study_groups WHERE parent_id = ?")?;
        let children = stmt
            .query_map([&group_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for child in children {
            if reachable.insert(child.clone()) {
                queue.push(child);
            }
        }
    }
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("schema");
        conn
    }

    fn seed_scope(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO organizations(id, name) VALUES('org', 'Physics');
             INSERT INTO terms(id, name) VALUES('term', 'WS 2026');
             INSERT INTO blocks(id, date, start_time, end_time, weekday)
               VALUES('blk', '2026-04-07', '08:00:00', '10:00:00', 2);
             INSERT INTO persons(id, display_name) VALUES('p1', 'Dr. A');
             INSERT INTO events(id, code, title) VALUES('ev', 'PHY201', 'Mechanics');
             INSERT INTO units(id, org_id, term_id, code) VALUES('u1', 'org', 'term', 'U-1');
             INSERT INTO instances(id, unit_id, block_id, event_id)
               VALUES('i1', 'u1', 'blk', 'ev');
             INSERT INTO instance_persons(id, instance_id, person_id)
               VALUES('a1', 'i1', 'p1');",
        )
        .expect("seed");
    }

    fn payload(date: &str, instances: serde_json::Value) -> serde_json::Value {
        json!({
            "creationDate": date,
            "creationTime": "03:00:00",
            "termId": "term",
            "instances": instances
        })
    }

    #[test]
    fn first_import_baselines_without_removed_storm() {
        let conn = test_conn();
        seed_scope(&conn);
        conn.execute_batch(
            "INSERT INTO instances(id, unit_id, block_id, event_id)
               VALUES('stale', 'u1', 'blk', 'ev');",
        )
        .expect("extra row");

        // The first snapshot does not mention 'stale'; it still must not be
        // flagged removed because there is no reference to diff against.
        let out = upload(
            &conn,
            "org",
            "scheduler",
            &payload("2026-04-07", json!({ "i1": { "p1": {} } })),
        )
        .expect("upload");
        assert!(out.first_import);
        assert_eq!(out.stats.retired, 0);

        let delta: String = conn
            .query_row("SELECT delta FROM instances WHERE id = 'stale'", [], |r| {
                r.get(0)
            })
            .expect("row");
        assert_eq!(delta, "");
    }

    #[test]
    fn second_import_diffs_against_reference() {
        let conn = test_conn();
        seed_scope(&conn);
        upload(
            &conn,
            "org",
            "scheduler",
            &payload("2026-04-07", json!({ "i1": { "p1": {} } })),
        )
        .expect("first upload");
        let out = upload(
            &conn,
            "org",
            "scheduler",
            &payload("2026-04-08", json!({})),
        )
        .expect("second upload");
        assert!(!out.first_import);

        let delta: String = conn
            .query_row("SELECT delta FROM units WHERE id = 'u1'", [], |r| r.get(0))
            .expect("row");
        assert_eq!(delta, "removed");
    }

    #[test]
    fn validation_failure_stores_nothing() {
        let conn = test_conn();
        seed_scope(&conn);
        let err = upload(&conn, "org", "scheduler", &json!({ "termId": "term" }))
            .expect_err("invalid payload");
        match err {
            UploadError::Validation(issues) => assert!(!issues.is_empty()),
            other => panic!("expected validation error, got {:?}", other),
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schedule_snapshots", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn guards_reject_before_any_write() {
        let conn = test_conn();
        seed_scope(&conn);
        conn.execute(
            "INSERT INTO organizations(id, name, scheduling_enabled) VALUES('frozen', 'X', 0)",
            [],
        )
        .expect("org");

        assert!(matches!(
            upload(&conn, "org", "student", &json!({})),
            Err(UploadError::Forbidden(_))
        ));
        assert!(matches!(
            upload(&conn, "nobody", "scheduler", &json!({})),
            Err(UploadError::Forbidden(_))
        ));
        assert!(matches!(
            upload(&conn, "frozen", "scheduler", &json!({})),
            Err(UploadError::SchedulingDisabled(_))
        ));
    }

    #[test]
    fn reachable_groups_walks_up_and_down() {
        let conn = test_conn();
        conn.execute_batch(
            "INSERT INTO study_groups(id, name, parent_id) VALUES('root', 'Faculty', NULL);
             INSERT INTO study_groups(id, name, parent_id) VALUES('a', 'Dept A', 'root');
             INSERT INTO study_groups(id, name, parent_id) VALUES('a1', 'Sem 1', 'a');
             INSERT INTO study_groups(id, name, parent_id) VALUES('b', 'Dept B', 'root');
             INSERT INTO study_groups(id, name, parent_id) VALUES('other', 'Elsewhere', NULL);",
        )
        .expect("tree");
        let start: BTreeSet<String> = ["a1".to_string()].into_iter().collect();
        let reachable = reachable_groups(&conn, &start).expect("walk");
        for id in ["root", "a", "a1", "b"] {
            assert!(reachable.contains(id), "missing {}", id);
        }
        assert!(!reachable.contains("other"));
    }
}
