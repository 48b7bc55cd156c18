use crate::db::{DELTA_CURRENT, DELTA_NEW, DELTA_REMOVED};
use crate::snapshot::ParsedSnapshot;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub confirmed: usize,
    pub resurrected: usize,
    pub retired: usize,
    pub skipped_refs: usize,
}

/// Scopes positively confirmed during a pass. Threaded explicitly through
/// every step and returned with the outcome; retirement reads it instead of
/// any shared mutable state.
#[derive(Debug, Default)]
pub struct TouchedScopes {
    pub units: BTreeSet<String>,
    pub instances: BTreeSet<String>,
}

#[derive(Debug)]
pub struct PassOutcome {
    pub stats: PassStats,
    pub touched: TouchedScopes,
}

/// Touch rule for one delta-tagged row. `None` means the row was already
/// stamped this pass and must not change again; otherwise a row resurrects
/// from `removed` to `new`, and anything else is confirmed current.
fn next_delta(delta: &str, modified: Option<&str>, stamp: &str) -> Option<&'static str> {
    if modified == Some(stamp) {
        return None;
    }
    if delta == DELTA_REMOVED {
        Some(DELTA_NEW)
    } else {
        Some(DELTA_CURRENT)
    }
}

fn bump(stats: &mut PassStats, applied: &str) {
    if applied == DELTA_NEW {
        stats.resurrected += 1;
    } else {
        stats.confirmed += 1;
    }
}

/// Walks one snapshot and updates delta flags/timestamps so they reflect
/// exactly the instances and associations present in it. Retirement for a
/// scope always runs strictly after all positive confirmations for that
/// scope. Dangling references are skipped, never fatal; the next upload
/// self-corrects a partial pass.
pub fn run_pass(
    conn: &Connection,
    org_id: &str,
    snap: &ParsedSnapshot,
    stamp: &str,
) -> rusqlite::Result<PassOutcome> {
    let mut stats = PassStats::default();
    let mut touched = TouchedScopes::default();

    for (instance_id, persons) in &snap.instances {
        let Some(unit_id) = touch_instance(conn, instance_id, stamp, &mut stats)? else {
            stats.skipped_refs += 1;
            continue;
        };
        touch_unit(conn, &unit_id, stamp, &mut stats)?;
        touched.units.insert(unit_id);
        touched.instances.insert(instance_id.clone());

        for (person_id, res) in persons {
            let Some(assoc_id) =
                touch_instance_person(conn, instance_id, person_id, stamp, &mut stats)?
            else {
                stats.skipped_refs += 1;
                continue;
            };
            for group_id in &res.groups {
                touch_assoc(
                    conn,
                    "instance_groups",
                    "group_id",
                    &assoc_id,
                    group_id,
                    stamp,
                    &mut stats,
                )?;
            }
            for room_id in &res.rooms {
                touch_assoc(
                    conn,
                    "instance_rooms",
                    "room_id",
                    &assoc_id,
                    room_id,
                    stamp,
                    &mut stats,
                )?;
            }
            stats.retired += retire_assoc_rows(conn, "instance_groups", &assoc_id, stamp)?;
            stats.retired += retire_assoc_rows(conn, "instance_rooms", &assoc_id, stamp)?;
        }
        stats.retired += retire_instance_persons(conn, instance_id, stamp)?;
    }

    stats.retired += retire_units(conn, org_id, &snap.term_id, &touched, stamp)?;
    for unit_id in &touched.units {
        stats.retired += retire_instances(conn, unit_id, stamp)?;
    }

    Ok(PassOutcome { stats, touched })
}

/// Returns the owning unit id, or None when the snapshot references an
/// instance this workspace has never seen.
fn touch_instance(
    conn: &Connection,
    instance_id: &str,
    stamp: &str,
    stats: &mut PassStats,
) -> rusqlite::Result<Option<String>> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT unit_id, delta, modified FROM instances WHERE id = ?",
            [instance_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((unit_id, delta, modified)) = row else {
        return Ok(None);
    };
    if let Some(next) = next_delta(&delta, modified.as_deref(), stamp) {
        conn.execute(
            "UPDATE instances SET delta = ?, modified = ? WHERE id = ?",
            (next, stamp, instance_id),
        )?;
        bump(stats, next);
    }
    Ok(Some(unit_id))
}

fn touch_unit(
    conn: &Connection,
    unit_id: &str,
    stamp: &str,
    stats: &mut PassStats,
) -> rusqlite::Result<()> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT delta, modified FROM units WHERE id = ?",
            [unit_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((delta, modified)) = row else {
        return Ok(());
    };
    if let Some(next) = next_delta(&delta, modified.as_deref(), stamp) {
        conn.execute(
            "UPDATE units SET delta = ?, modified = ? WHERE id = ?",
            (next, stamp, unit_id),
        )?;
        bump(stats, next);
    }
    Ok(())
}

/// Returns the association id (owner key for group/room rows), or None when
/// the (instance, person) pair is unknown.
fn touch_instance_person(
    conn: &Connection,
    instance_id: &str,
    person_id: &str,
    stamp: &str,
    stats: &mut PassStats,
) -> rusqlite::Result<Option<String>> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, delta, modified FROM instance_persons
             WHERE instance_id = ? AND person_id = ?",
            (instance_id, person_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((assoc_id, delta, modified)) = row else {
        return Ok(None);
    };
    if let Some(next) = next_delta(&delta, modified.as_deref(), stamp) {
        conn.execute(
            "UPDATE instance_persons SET delta = ?, modified = ? WHERE id = ?",
            (next, stamp, &assoc_id),
        )?;
        bump(stats, next);
    }
    Ok(Some(assoc_id))
}

fn touch_assoc(
    conn: &Connection,
    table: &str,
    key_col: &str,
    assoc_id: &str,
    resource_id: &str,
    stamp: &str,
    stats: &mut PassStats,
) -> rusqlite::Result<()> {
    let sql = format!(
        "SELECT delta, modified FROM {} WHERE assoc_id = ? AND {} = ?",
        table, key_col
    );
    let row: Option<(String, Option<String>)> = conn
        .query_row(&sql, (assoc_id, resource_id), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()?;
    let Some((delta, modified)) = row else {
        stats.skipped_refs += 1;
        return Ok(());
    };
    if let Some(next) = next_delta(&delta, modified.as_deref(), stamp) {
        let sql = format!(
            "UPDATE {} SET delta = ?, modified = ? WHERE assoc_id = ? AND {} = ?",
            table, key_col
        );
        conn.execute(&sql, (next, stamp, assoc_id, resource_id))?;
        bump(stats, next);
    }
    Ok(())
}

/// Negative-space update: everything under this assoc that was not stamped
/// during the positive sweep is gone from the snapshot and gets `removed`.
fn retire_assoc_rows(
    conn: &Connection,
    table: &str,
    assoc_id: &str,
    stamp: &str,
) -> rusqlite::Result<usize> {
    let sql = format!(
        "UPDATE {} SET delta = ?, modified = ?
         WHERE assoc_id = ? AND delta != ? AND (modified IS NULL OR modified != ?)",
        table
    );
    conn.execute(&sql, (DELTA_REMOVED, stamp, assoc_id, DELTA_REMOVED, stamp))
}

fn retire_instance_persons(
    conn: &Connection,
    instance_id: &str,
    stamp: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE instance_persons SET delta = ?, modified = ?
         WHERE instance_id = ? AND delta != ? AND (modified IS NULL OR modified != ?)",
        (DELTA_REMOVED, stamp, instance_id, DELTA_REMOVED, stamp),
    )
}

fn retire_units(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
    touched: &TouchedScopes,
    stamp: &str,
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM units
         WHERE org_id = ? AND term_id = ? AND delta != ?
           AND (modified IS NULL OR modified != ?)",
    )?;
    let candidates = stmt
        .query_map((org_id, term_id, DELTA_REMOVED, stamp), |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut retired = 0;
    for unit_id in candidates {
        if touched.units.contains(&unit_id) {
            continue;
        }
        retired += conn.execute(
            "UPDATE units SET delta = ?, modified = ? WHERE id = ?",
            (DELTA_REMOVED, stamp, &unit_id),
        )?;
    }
    Ok(retired)
}

/// Instances of a touched unit absent from the snapshot. Instances under
/// untouched units keep their flags; the unit itself carries `removed` and
/// the next pass settles the rest.
fn retire_instances(conn: &Connection, unit_id: &str, stamp: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE instances SET delta = ?, modified = ?
         WHERE unit_id = ? AND delta != ? AND (modified IS NULL OR modified != ?)",
        (DELTA_REMOVED, stamp, unit_id, DELTA_REMOVED, stamp),
    )
}
