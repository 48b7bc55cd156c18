use crate::db::DELTA_REMOVED;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};

/// Closed set of mergeable resource kinds. Each kind carries its own merge
/// strategy; selection is an explicit enum, never name construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Room,
    Event,
    Person,
    Group,
}

impl MergeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "room" => Some(Self::Room),
            "event" => Some(Self::Event),
            "person" => Some(Self::Person),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Room => "rooms",
            Self::Event => "events",
            Self::Person => "persons",
            Self::Group => "study_groups",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Event => "event",
            Self::Person => "person",
            Self::Group => "group",
        }
    }
}

#[derive(Debug)]
pub enum MergeError {
    BadSelection(String),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for MergeError {
    fn from(e: rusqlite::Error) -> Self {
        MergeError::Db(e)
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub survivor: String,
    pub absorbed: Vec<String>,
    pub retargeted_rows: usize,
    pub merged_assoc_rows: usize,
    pub rewritten_snapshots: usize,
    pub deleted_resources: usize,
}

/// Consolidates duplicate resource identities into `selected[0]`. Rewrites
/// simple foreign keys, reconciles delta-tagged association tables that may
/// hold duplicate keys after the rewrite, rewrites embedded id lists inside
/// stored snapshot payloads, and deletes the absorbed resource rows. The
/// whole merge runs in one transaction; the first failing write rolls
/// everything back.
pub fn merge(
    conn: &Connection,
    kind: MergeKind,
    selected: &[String],
) -> Result<MergeOutcome, MergeError> {
    if selected.len() < 2 {
        return Err(MergeError::BadSelection(
            "select at least two resources to merge".to_string(),
        ));
    }
    let survivor = selected[0].clone();
    let mut absorbed: Vec<String> = Vec::new();
    for id in &selected[1..] {
        if *id != survivor && !absorbed.contains(id) {
            absorbed.push(id.clone());
        }
    }
    if absorbed.is_empty() {
        return Err(MergeError::BadSelection(
            "selection contains no second identity".to_string(),
        ));
    }

    for id in std::iter::once(&survivor).chain(absorbed.iter()) {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
        let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
        if found.is_none() {
            return Err(MergeError::BadSelection(format!(
                "unknown {} {}",
                kind.label(),
                id
            )));
        }
    }

    let absorbed_set: BTreeSet<String> = absorbed.iter().cloned().collect();
    let tx = conn.unchecked_transaction()?;
    let mut out = MergeOutcome {
        survivor: survivor.clone(),
        absorbed: absorbed.clone(),
        ..MergeOutcome::default()
    };

    match kind {
        MergeKind::Room => {
            let (retargeted, merged) =
                consolidate_assoc(&tx, "instance_rooms", "assoc_id", "room_id", &survivor, &absorbed_set)?;
            out.retargeted_rows += retargeted;
            out.merged_assoc_rows += merged;
            out.rewritten_snapshots = rewrite_snapshot_blobs(&tx, kind, &survivor, &absorbed_set)?;
        }
        MergeKind::Group => {
            let (retargeted, merged) =
                consolidate_assoc(&tx, "instance_groups", "assoc_id", "group_id", &survivor, &absorbed_set)?;
            out.retargeted_rows += retargeted;
            out.merged_assoc_rows += merged;
            out.retargeted_rows += retarget_in(
                &tx,
                "UPDATE study_groups SET parent_id = ? WHERE parent_id IN",
                &survivor,
                &absorbed,
            )?;
            // The rewrite can point the survivor at itself when its old
            // parent was absorbed.
            tx.execute(
                "UPDATE study_groups SET parent_id = NULL WHERE id = ? AND parent_id = ?",
                (&survivor, &survivor),
            )?;
            out.retargeted_rows += retarget_in(
                &tx,
                "UPDATE subjects SET group_id = ? WHERE group_id IN",
                &survivor,
                &absorbed,
            )?;
            out.rewritten_snapshots = rewrite_snapshot_blobs(&tx, kind, &survivor, &absorbed_set)?;
        }
        MergeKind::Person => {
            let (retargeted, merged) = consolidate_person_assocs(&tx, &survivor, &absorbed_set)?;
            out.retargeted_rows += retargeted;
            out.merged_assoc_rows += merged;
            out.retargeted_rows += retarget_participants(&tx, &survivor, &absorbed)?;
            out.retargeted_rows += retarget_in(
                &tx,
                "UPDATE booking_checkins SET person_id = ? WHERE person_id IN",
                &survivor,
                &absorbed,
            )?;
            out.rewritten_snapshots = rewrite_snapshot_blobs(&tx, kind, &survivor, &absorbed_set)?;
        }
        MergeKind::Event => {
            out.retargeted_rows += retarget_in(
                &tx,
                "UPDATE instances SET event_id = ? WHERE event_id IN",
                &survivor,
                &absorbed,
            )?;
            // Events are referenced by instance id inside payload blobs, so
            // there is nothing to rewrite there.
        }
    }

    out.deleted_resources = delete_in(
        &tx,
        &format!("DELETE FROM {} WHERE id IN", kind.table()),
        &absorbed,
    )?;

    tx.commit()?;
    Ok(out)
}

#[derive(Debug, Clone)]
struct AssocRow {
    owner: String,
    key: String,
    delta: String,
    modified: Option<String>,
}

/// Duplicate-key reconciliation for one delta-tagged association table.
/// Groups rows whose resource key is any merged id by their owning scope;
/// at most one row per owner survives, retargeted to the surviving id:
/// prefer non-removed, then most-recently-modified. When every row of a
/// group is `removed`, one is still kept so the delta history survives the
/// retention window.
fn consolidate_assoc(
    conn: &Connection,
    table: &str,
    owner_col: &str,
    key_col: &str,
    survivor: &str,
    absorbed: &BTreeSet<String>,
) -> rusqlite::Result<(usize, usize)> {
    let mut ids: Vec<String> = vec![survivor.to_string()];
    ids.extend(absorbed.iter().cloned());
    let sql = format!(
        "SELECT {}, {}, delta, modified FROM {} WHERE {} IN ({}) ORDER BY {}, modified",
        owner_col,
        key_col,
        table,
        key_col,
        placeholders(ids.len()),
        owner_col,
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), |r| {
            Ok(AssocRow {
                owner: r.get(0)?,
                key: r.get(1)?,
                delta: r.get(2)?,
                modified: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_owner: BTreeMap<String, Vec<AssocRow>> = BTreeMap::new();
    for row in rows {
        by_owner.entry(row.owner.clone()).or_default().push(row);
    }

    let mut retargeted = 0;
    let mut merged = 0;
    for (owner, group) in by_owner {
        let keeper = pick_keeper(&group);
        for (i, row) in group.iter().enumerate() {
            if i == keeper {
                continue;
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} = ? AND {} = ?",
                table, owner_col, key_col
            );
            conn.execute(&sql, (&owner, &row.key))?;
            merged += 1;
        }
        if group[keeper].key != survivor {
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE {} = ? AND {} = ?",
                table, key_col, owner_col, key_col
            );
            conn.execute(&sql, (survivor, &owner, &group[keeper].key))?;
            retargeted += 1;
        }
    }
    Ok((retargeted, merged))
}

/// Person variant of [`consolidate_assoc`]. Lecturer assoc rows own group
/// and room rows keyed by their id, so a losing duplicate cannot simply be
/// deleted: its children move to the keeper first (on a key collision the
/// keeper's child row wins).
fn consolidate_person_assocs(
    conn: &Connection,
    survivor: &str,
    absorbed: &BTreeSet<String>,
) -> rusqlite::Result<(usize, usize)> {
    let mut ids: Vec<String> = vec![survivor.to_string()];
    ids.extend(absorbed.iter().cloned());
    let sql = format!(
        "SELECT id, instance_id, person_id, delta, modified FROM instance_persons
         WHERE person_id IN ({}) ORDER BY instance_id, modified",
        placeholders(ids.len()),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                AssocRow {
                    owner: r.get(1)?,
                    key: r.get(2)?,
                    delta: r.get(3)?,
                    modified: r.get(4)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_instance: BTreeMap<String, Vec<(String, AssocRow)>> = BTreeMap::new();
    for (id, row) in rows {
        by_instance.entry(row.owner.clone()).or_default().push((id, row));
    }

    let mut retargeted = 0;
    let mut merged = 0;
    for (_, group) in by_instance {
        let plain: Vec<AssocRow> = group.iter().map(|(_, r)| r.clone()).collect();
        let keeper = pick_keeper(&plain);
        let keeper_id = group[keeper].0.clone();
        for (i, (assoc_id, _)) in group.iter().enumerate() {
            if i == keeper {
                continue;
            }
            rehome_assoc_children(conn, assoc_id, &keeper_id)?;
            conn.execute("DELETE FROM instance_persons WHERE id = ?", [assoc_id])?;
            merged += 1;
        }
        if group[keeper].1.key != survivor {
            conn.execute(
                "UPDATE instance_persons SET person_id = ? WHERE id = ?",
                (survivor, &keeper_id),
            )?;
            retargeted += 1;
        }
    }
    Ok((retargeted, merged))
}

fn rehome_assoc_children(conn: &Connection, loser: &str, keeper: &str) -> rusqlite::Result<()> {
    for (table, key_col) in [("instance_groups", "group_id"), ("instance_rooms", "room_id")] {
        let sql = format!(
            "DELETE FROM {t} WHERE assoc_id = ?1
               AND {k} IN (SELECT {k} FROM {t} WHERE assoc_id = ?2)",
            t = table,
            k = key_col,
        );
        conn.execute(&sql, (loser, keeper))?;
        let sql = format!("UPDATE {} SET assoc_id = ?2 WHERE assoc_id = ?1", table);
        conn.execute(&sql, (loser, keeper))?;
    }
    Ok(())
}

fn pick_keeper(group: &[AssocRow]) -> usize {
    let mut best = 0;
    for (i, row) in group.iter().enumerate().skip(1) {
        let b = &group[best];
        let row_live = row.delta != DELTA_REMOVED;
        let best_live = b.delta != DELTA_REMOVED;
        let better = if row_live != best_live {
            row_live
        } else {
            (row.modified.as_deref(), row.key.as_str())
                > (b.modified.as_deref(), b.key.as_str())
        };
        if better {
            best = i;
        }
    }
    best
}

/// Rewrites the embedded id arrays (or person map keys) inside every stored
/// snapshot payload so the blobs agree with the merged identities.
fn rewrite_snapshot_blobs(
    conn: &Connection,
    kind: MergeKind,
    survivor: &str,
    absorbed: &BTreeSet<String>,
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("SELECT id, payload FROM schedule_snapshots")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rewritten = 0;
    for (id, payload) in rows {
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&payload) else {
            continue;
        };
        let changed = match kind {
            MergeKind::Room => rewrite_resource_arrays(&mut value, "rooms", survivor, absorbed),
            MergeKind::Group => rewrite_resource_arrays(&mut value, "groups", survivor, absorbed),
            MergeKind::Person => rewrite_person_entries(&mut value, survivor, absorbed),
            MergeKind::Event => false,
        };
        if changed {
            conn.execute(
                "UPDATE schedule_snapshots SET payload = ? WHERE id = ?",
                (value.to_string(), &id),
            )?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Removes every occurrence of an absorbed id from the named per-person
/// array and appends the survivor exactly once.
fn rewrite_resource_arrays(
    payload: &mut serde_json::Value,
    key: &str,
    survivor: &str,
    absorbed: &BTreeSet<String>,
) -> bool {
    let Some(instances) = payload.get_mut("instances").and_then(|v| v.as_object_mut()) else {
        return false;
    };
    let mut changed = false;
    for persons in instances.values_mut() {
        let Some(persons) = persons.as_object_mut() else {
            continue;
        };
        for res in persons.values_mut() {
            let Some(arr) = res.get_mut(key).and_then(|v| v.as_array_mut()) else {
                continue;
            };
            let hit = arr
                .iter()
                .any(|v| v.as_str().map(|s| absorbed.contains(s)).unwrap_or(false));
            if !hit {
                continue;
            }
            arr.retain(|v| {
                v.as_str()
                    .map(|s| !absorbed.contains(s) && s != survivor)
                    .unwrap_or(true)
            });
            arr.push(serde_json::Value::String(survivor.to_string()));
            changed = true;
        }
    }
    changed
}

/// Folds absorbed person entries into the survivor's entry per instance,
/// unioning the groups/rooms lists (order-preserving).
fn rewrite_person_entries(
    payload: &mut serde_json::Value,
    survivor: &str,
    absorbed: &BTreeSet<String>,
) -> bool {
    let Some(instances) = payload.get_mut("instances").and_then(|v| v.as_object_mut()) else {
        return false;
    };
    let mut changed = false;
    for persons in instances.values_mut() {
        let Some(persons) = persons.as_object_mut() else {
            continue;
        };
        let present: Vec<String> = persons
            .keys()
            .filter(|k| absorbed.contains(*k))
            .cloned()
            .collect();
        if present.is_empty() {
            continue;
        }
        let mut folded = persons
            .remove(survivor)
            .unwrap_or_else(|| serde_json::json!({ "groups": [], "rooms": [] }));
        for key in present {
            let entry = persons.remove(&key).unwrap_or_default();
            for list in ["groups", "rooms"] {
                union_ids(&mut folded, &entry, list);
            }
        }
        persons.insert(survivor.to_string(), folded);
        changed = true;
    }
    changed
}

fn union_ids(dst: &mut serde_json::Value, src: &serde_json::Value, key: &str) {
    let incoming: Vec<String> = src
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if incoming.is_empty() {
        return;
    }
    if dst.get(key).and_then(|v| v.as_array()).is_none() {
        dst[key] = serde_json::json!([]);
    }
    if let Some(arr) = dst.get_mut(key).and_then(|v| v.as_array_mut()) {
        for id in incoming {
            let already = arr.iter().any(|v| v.as_str() == Some(id.as_str()));
            if !already {
                arr.push(serde_json::Value::String(id));
            }
        }
    }
}

fn retarget_participants(
    conn: &Connection,
    survivor: &str,
    absorbed: &[String],
) -> rusqlite::Result<usize> {
    let sql = format!(
        "SELECT id, instance_id FROM instance_participants WHERE person_id IN ({})",
        placeholders(absorbed.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(absorbed.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut touched = 0;
    for (row_id, instance_id) in rows {
        let survivor_row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM instance_participants WHERE instance_id = ? AND person_id = ?",
                (&instance_id, survivor),
                |r| r.get(0),
            )
            .optional()?;
        if survivor_row.is_some() {
            conn.execute("DELETE FROM instance_participants WHERE id = ?", [&row_id])?;
        } else {
            conn.execute(
                "UPDATE instance_participants SET person_id = ? WHERE id = ?",
                (survivor, &row_id),
            )?;
        }
        touched += 1;
    }
    Ok(touched)
}

fn retarget_in(
    conn: &Connection,
    sql_prefix: &str,
    survivor: &str,
    absorbed: &[String],
) -> rusqlite::Result<usize> {
    let sql = format!("{} ({})", sql_prefix, placeholders(absorbed.len()));
    let mut params: Vec<&str> = vec![survivor];
    params.extend(absorbed.iter().map(|s| s.as_str()));
    conn.execute(&sql, params_from_iter(params))
}

fn delete_in(conn: &Connection, sql_prefix: &str, ids: &[String]) -> rusqlite::Result<usize> {
    let sql = format!("{} ({})", sql_prefix, placeholders(ids.len()));
    conn.execute(&sql, params_from_iter(ids.iter()))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
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

    fn seed_world(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO organizations(id, name) VALUES('org', 'Physics');
             INSERT INTO terms(id, name) VALUES('term', 'WS 2026');
             INSERT INTO blocks(id, date, start_time, end_time, weekday)
               VALUES('blk', '2026-04-07', '08:00:00', '10:00:00', 2);
             INSERT INTO rooms(id, name) VALUES('r5', 'HS 1');
             INSERT INTO rooms(id, name) VALUES('r7', 'Hörsaal 1');
             INSERT INTO study_groups(id, name) VALUES('g1', 'Semester 2');
             INSERT INTO persons(id, display_name) VALUES('p5', 'A. Muster');
             INSERT INTO persons(id, display_name) VALUES('p7', 'Anna Muster');
             INSERT INTO events(id, code, title) VALUES('ev', 'PHY201', 'Mechanics');
             INSERT INTO units(id, org_id, term_id, code) VALUES('u1', 'org', 'term', 'U-1');
             INSERT INTO instances(id, unit_id, block_id, event_id)
               VALUES('i1', 'u1', 'blk', 'ev');",
        )
        .expect("seed");
    }

    fn row(owner: &str, key: &str, delta: &str, modified: &str) -> AssocRow {
        AssocRow {
            owner: owner.to_string(),
            key: key.to_string(),
            delta: delta.to_string(),
            modified: Some(modified.to_string()),
        }
    }

    #[test]
    fn keeper_prefers_live_then_recent() {
        let group = vec![
            row("a", "5", "removed", "2026-04-09 03:00:00"),
            row("a", "7", "", "2026-04-07 03:00:00"),
            row("a", "9", "", "2026-04-08 03:00:00"),
        ];
        assert_eq!(pick_keeper(&group), 2);
    }

    #[test]
    fn keeper_keeps_history_when_all_removed() {
        let group = vec![
            row("a", "5", "removed", "2026-04-07 03:00:00"),
            row("a", "7", "removed", "2026-04-09 03:00:00"),
        ];
        assert_eq!(pick_keeper(&group), 1);
    }

    #[test]
    fn consolidation_leaves_one_retargeted_row_per_owner() {
        let conn = test_conn();
        seed_world(&conn);
        conn.execute_batch(
            "INSERT INTO instance_persons(id, instance_id, person_id)
               VALUES('a', 'i1', 'p5');
             INSERT INTO instance_persons(id, instance_id, person_id)
               VALUES('b', 'i1', 'p7');
             INSERT INTO instance_rooms(assoc_id, room_id, delta, modified)
               VALUES('a', 'r5', '', '2026-04-07 03:00:00');
             INSERT INTO instance_rooms(assoc_id, room_id, delta, modified)
               VALUES('a', 'r7', '', '2026-04-08 03:00:00');
             INSERT INTO instance_rooms(assoc_id, room_id, delta, modified)
               VALUES('b', 'r7', 'removed', '2026-04-08 03:00:00');",
        )
        .expect("seed");

        let absorbed: BTreeSet<String> = ["r7".to_string()].into_iter().collect();
        let (retargeted, merged) =
            consolidate_assoc(&conn, "instance_rooms", "assoc_id", "room_id", "r5", &absorbed)
                .expect("consolidate");
        assert_eq!(merged, 1);
        assert_eq!(retargeted, 2);

        let (count, delta, modified): (i64, String, String) = conn
            .query_row(
                "SELECT COUNT(*), delta, modified FROM instance_rooms WHERE assoc_id = 'a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("row");
        assert_eq!(count, 1);
        assert_eq!(delta, "");
        assert_eq!(modified, "2026-04-08 03:00:00");

        // The all-removed owner still keeps exactly one retargeted row.
        let (count, key): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), room_id FROM instance_rooms WHERE assoc_id = 'b'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("row");
        assert_eq!(count, 1);
        assert_eq!(key, "r5");
    }

    #[test]
    fn person_consolidation_rehomes_children_of_losing_assoc() {
        let conn = test_conn();
        seed_world(&conn);
        conn.execute_batch(
            "INSERT INTO instance_persons(id, instance_id, person_id, delta, modified)
               VALUES('a1', 'i1', 'p5', '', '2026-04-08 03:00:00');
             INSERT INTO instance_persons(id, instance_id, person_id, delta, modified)
               VALUES('a2', 'i1', 'p7', '', '2026-04-07 03:00:00');
             INSERT INTO instance_groups(assoc_id, group_id, delta, modified)
               VALUES('a1', 'g1', '', '2026-04-08 03:00:00');
             INSERT INTO instance_groups(assoc_id, group_id, delta, modified)
               VALUES('a2', 'g1', '', '2026-04-07 03:00:00');
             INSERT INTO instance_rooms(assoc_id, room_id, delta, modified)
               VALUES('a2', 'r5', '', '2026-04-07 03:00:00');",
        )
        .expect("seed");

        let absorbed: BTreeSet<String> = ["p7".to_string()].into_iter().collect();
        let (retargeted, merged) =
            consolidate_person_assocs(&conn, "p5", &absorbed).expect("consolidate");
        assert_eq!(merged, 1);
        assert_eq!(retargeted, 0);

        let keeper: String = conn
            .query_row(
                "SELECT person_id FROM instance_persons WHERE instance_id = 'i1'",
                [],
                |r| r.get(0),
            )
            .expect("one assoc left");
        assert_eq!(keeper, "p5");
        // The loser's room row moved over; the colliding group row is gone.
        let rooms: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM instance_rooms WHERE assoc_id = 'a1'",
                [],
                |r| r.get(0),
            )
            .expect("rooms");
        assert_eq!(rooms, 1);
        let groups: i64 = conn
            .query_row("SELECT COUNT(*) FROM instance_groups", [], |r| r.get(0))
            .expect("groups");
        assert_eq!(groups, 1);
    }

    #[test]
    fn resource_array_rewrite_appends_survivor_once() {
        let mut payload = json!({
            "instances": {
                "i1": { "p1": { "groups": [], "rooms": ["r5", "r7"] } },
                "i2": { "p1": { "groups": [], "rooms": ["r9"] } }
            }
        });
        let absorbed: BTreeSet<String> = ["r7".to_string()].into_iter().collect();
        assert!(rewrite_resource_arrays(&mut payload, "rooms", "r5", &absorbed));
        assert_eq!(
            payload["instances"]["i1"]["p1"]["rooms"],
            json!(["r5"]),
            "survivor appears exactly once"
        );
        assert_eq!(payload["instances"]["i2"]["p1"]["rooms"], json!(["r9"]));
    }

    #[test]
    fn person_entry_rewrite_unions_resources() {
        let mut payload = json!({
            "instances": {
                "i1": {
                    "p5": { "groups": ["g1"], "rooms": ["r1"] },
                    "p7": { "groups": ["g1", "g2"], "rooms": [] }
                }
            }
        });
        let absorbed: BTreeSet<String> = ["p7".to_string()].into_iter().collect();
        assert!(rewrite_person_entries(&mut payload, "p5", &absorbed));
        let persons = payload["instances"]["i1"].as_object().expect("persons");
        assert!(!persons.contains_key("p7"));
        assert_eq!(persons["p5"]["groups"], json!(["g1", "g2"]));
        assert_eq!(persons["p5"]["rooms"], json!(["r1"]));
    }

    #[test]
    fn merge_rejects_degenerate_selections() {
        let conn = test_conn();
        conn.execute("INSERT INTO rooms(id, name) VALUES('r1', 'HS 1')", [])
            .expect("room");
        assert!(matches!(
            merge(&conn, MergeKind::Room, &["r1".to_string()]),
            Err(MergeError::BadSelection(_))
        ));
        assert!(matches!(
            merge(&conn, MergeKind::Room, &["r1".to_string(), "r1".to_string()]),
            Err(MergeError::BadSelection(_))
        ));
        assert!(matches!(
            merge(&conn, MergeKind::Room, &["r1".to_string(), "ghost".to_string()]),
            Err(MergeError::BadSelection(_))
        ));
    }
}
