use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::pipeline::{self, UploadError};
use rusqlite::Connection;
use serde_json::json;

fn upload(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let org_id = get_required_str(params, "organizationId")?;
    let role = get_required_str(params, "role")?;
    let payload = params
        .get("payload")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing payload"))?;

    match pipeline::upload(conn, &org_id, &role, &payload) {
        Ok(outcome) => Ok(json!({
            "snapshotId": outcome.snapshot_id,
            "passStamp": outcome.pass_stamp,
            "firstImport": outcome.first_import,
            "confirmed": outcome.stats.confirmed,
            "resurrected": outcome.stats.resurrected,
            "retired": outcome.stats.retired,
            "skippedRefs": outcome.stats.skipped_refs,
            "prunedSnapshots": outcome.pruned_snapshots,
            "deletedBookings": outcome.deleted_bookings,
            "deletedParticipants": outcome.deleted_participants,
            "linkedEvents": outcome.linked_events,
        })),
        Err(UploadError::Forbidden(message)) => Err(HandlerErr {
            code: "forbidden",
            message,
            details: None,
        }),
        Err(UploadError::SchedulingDisabled(message)) => Err(HandlerErr {
            code: "not_implemented",
            message,
            details: None,
        }),
        Err(UploadError::Validation(issues)) => Err(HandlerErr {
            code: "validation_failed",
            message: "schedule payload failed validation".to_string(),
            details: Some(json!({ "issues": issues })),
        }),
        Err(UploadError::Db(e)) => Err(HandlerErr::db_update(e, "schedule upload pass")),
    }
}

fn list_snapshots(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let org_id = get_required_str(params, "organizationId")?;
    let term_id = get_required_str(params, "termId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, creation_date, creation_time, payload FROM schedule_snapshots
             WHERE org_id = ? AND term_id = ?
             ORDER BY creation_date, creation_time, rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&org_id, &term_id), |r| {
            let payload_raw: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "creationDate": r.get::<_, String>(1)?,
                "creationTime": r.get::<_, String>(2)?,
                "payload": serde_json::from_str::<serde_json::Value>(&payload_raw)
                    .unwrap_or(serde_json::Value::Null),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "snapshots": rows }))
}

/// Full delta-tagged hierarchy for one (organization, term), the surface
/// change highlighting and check-in features read from.
fn state_view(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let org_id = get_required_str(params, "organizationId")?;
    let term_id = get_required_str(params, "termId")?;

    let units = collect(
        conn,
        "SELECT id, code, delta, modified FROM units
         WHERE org_id = ?1 AND term_id = ?2 ORDER BY code",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "delta": r.get::<_, String>(2)?,
                "modified": r.get::<_, Option<String>>(3)?,
            }))
        },
    )?;
    let instances = collect(
        conn,
        "SELECT i.id, i.unit_id, i.block_id, i.event_id, i.delta, i.modified FROM instances i
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY i.id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "unitId": r.get::<_, String>(1)?,
                "blockId": r.get::<_, String>(2)?,
                "eventId": r.get::<_, String>(3)?,
                "delta": r.get::<_, String>(4)?,
                "modified": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    let instance_persons = collect(
        conn,
        "SELECT ip.id, ip.instance_id, ip.person_id, ip.role, ip.delta, ip.modified
         FROM instance_persons ip
         JOIN instances i ON i.id = ip.instance_id
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY ip.id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "instanceId": r.get::<_, String>(1)?,
                "personId": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "delta": r.get::<_, String>(4)?,
                "modified": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    let instance_groups = collect(
        conn,
        "SELECT g.assoc_id, g.group_id, g.delta, g.modified FROM instance_groups g
         JOIN instance_persons ip ON ip.id = g.assoc_id
         JOIN instances i ON i.id = ip.instance_id
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY g.assoc_id, g.group_id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "assocId": r.get::<_, String>(0)?,
                "groupId": r.get::<_, String>(1)?,
                "delta": r.get::<_, String>(2)?,
                "modified": r.get::<_, Option<String>>(3)?,
            }))
        },
    )?;
    let instance_rooms = collect(
        conn,
        "SELECT g.assoc_id, g.room_id, g.delta, g.modified FROM instance_rooms g
         JOIN instance_persons ip ON ip.id = g.assoc_id
         JOIN instances i ON i.id = ip.instance_id
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY g.assoc_id, g.room_id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "assocId": r.get::<_, String>(0)?,
                "roomId": r.get::<_, String>(1)?,
                "delta": r.get::<_, String>(2)?,
                "modified": r.get::<_, Option<String>>(3)?,
            }))
        },
    )?;
    let bookings = collect(
        conn,
        "SELECT b.id, b.block_id, b.unit_id FROM bookings b
         JOIN units u ON u.id = b.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY b.id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "blockId": r.get::<_, String>(1)?,
                "unitId": r.get::<_, String>(2)?,
            }))
        },
    )?;
    let participants = collect(
        conn,
        "SELECT p.id, p.instance_id, p.person_id, p.status FROM instance_participants p
         JOIN instances i ON i.id = p.instance_id
         JOIN units u ON u.id = i.unit_id
         WHERE u.org_id = ?1 AND u.term_id = ?2 ORDER BY p.id",
        &org_id,
        &term_id,
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "instanceId": r.get::<_, String>(1)?,
                "personId": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
            }))
        },
    )?;

    Ok(json!({
        "units": units,
        "instances": instances,
        "instancePersons": instance_persons,
        "instanceGroups": instance_groups,
        "instanceRooms": instance_rooms,
        "bookings": bookings,
        "participants": participants,
    }))
}

fn collect(
    conn: &Connection,
    sql: &str,
    org_id: &str,
    term_id: &str,
    map: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    stmt.query_map((org_id, term_id), |r| map(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "schedule.upload" => Some(upload(conn, params)),
        "schedule.listSnapshots" => Some(list_snapshots(conn, params)),
        "schedule.state" => Some(state_view(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("schedule.") {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    match dispatch(conn, req.method.as_str(), &req.params)? {
        Ok(result) => Some(ok(&req.id, result)),
        Err(error) => Some(error.response(&req.id)),
    }
}
