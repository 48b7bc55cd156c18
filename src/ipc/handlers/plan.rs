use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, new_id, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn create_block(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    let start_time = get_required_str(params, "startTime")?;
    let end_time = get_required_str(params, "endTime")?;
    let parsed = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    for (key, value) in [("startTime", &start_time), ("endTime", &end_time)] {
        if NaiveTime::parse_from_str(value, "%H:%M:%S").is_err() {
            return Err(HandlerErr::bad_params(format!("{} must be HH:MM:SS", key)));
        }
    }
    let weekday = parsed.weekday().number_from_monday() as i64;
    let id = new_id();
    conn.execute(
        "INSERT INTO blocks(id, date, start_time, end_time, weekday) VALUES(?, ?, ?, ?, ?)",
        (&id, &date, &start_time, &end_time, weekday),
    )
    .map_err(|e| HandlerErr::db_update(e, "blocks"))?;
    Ok(json!({ "blockId": id, "weekday": weekday }))
}

fn create_unit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let org_id = get_required_str(params, "organizationId")?;
    let term_id = get_required_str(params, "termId")?;
    let code = get_required_str(params, "code")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO units(id, org_id, term_id, code) VALUES(?, ?, ?, ?)",
        (&id, &org_id, &term_id, &code),
    )
    .map_err(|e| HandlerErr::db_update(e, "units"))?;
    Ok(json!({ "unitId": id }))
}

fn create_instance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let unit_id = get_required_str(params, "unitId")?;
    let block_id = get_required_str(params, "blockId")?;
    let event_id = get_required_str(params, "eventId")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO instances(id, unit_id, block_id, event_id) VALUES(?, ?, ?, ?)",
        (&id, &unit_id, &block_id, &event_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "instances"))?;
    Ok(json!({ "instanceId": id }))
}

fn assign_person(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instance_id = get_required_str(params, "instanceId")?;
    let person_id = get_required_str(params, "personId")?;
    let role = get_optional_str(params, "role").unwrap_or_else(|| "lecturer".to_string());
    let id = new_id();
    conn.execute(
        "INSERT INTO instance_persons(id, instance_id, person_id, role) VALUES(?, ?, ?, ?)",
        (&id, &instance_id, &person_id, &role),
    )
    .map_err(|e| HandlerErr::db_update(e, "instance_persons"))?;
    Ok(json!({ "assocId": id }))
}

fn assign_group(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assoc_id = get_required_str(params, "assocId")?;
    let group_id = get_required_str(params, "groupId")?;
    conn.execute(
        "INSERT INTO instance_groups(assoc_id, group_id) VALUES(?, ?)",
        (&assoc_id, &group_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "instance_groups"))?;
    Ok(json!({ "ok": true }))
}

fn assign_room(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assoc_id = get_required_str(params, "assocId")?;
    let room_id = get_required_str(params, "roomId")?;
    conn.execute(
        "INSERT INTO instance_rooms(assoc_id, room_id) VALUES(?, ?)",
        (&assoc_id, &room_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "instance_rooms"))?;
    Ok(json!({ "ok": true }))
}

fn create_booking(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let block_id = get_required_str(params, "blockId")?;
    let unit_id = get_required_str(params, "unitId")?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM bookings WHERE block_id = ? AND unit_id = ?",
            (&block_id, &unit_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(id) = existing {
        return Ok(json!({ "bookingId": id, "existed": true }));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO bookings(id, block_id, unit_id) VALUES(?, ?, ?)",
        (&id, &block_id, &unit_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "bookings"))?;
    Ok(json!({ "bookingId": id, "existed": false }))
}

fn check_in(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let booking_id = get_required_str(params, "bookingId")?;
    let person_id = get_required_str(params, "personId")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO booking_checkins(id, booking_id, person_id) VALUES(?, ?, ?)",
        (&id, &booking_id, &person_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "booking_checkins"))?;
    Ok(json!({ "checkinId": id }))
}

fn register_participant(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let instance_id = get_required_str(params, "instanceId")?;
    let person_id = get_required_str(params, "personId")?;
    let status = get_optional_str(params, "status").unwrap_or_else(|| "registered".to_string());
    let id = new_id();
    conn.execute(
        "INSERT INTO instance_participants(id, instance_id, person_id, status)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(instance_id, person_id) DO UPDATE SET status = excluded.status",
        (&id, &instance_id, &person_id, &status),
    )
    .map_err(|e| HandlerErr::db_update(e, "instance_participants"))?;
    Ok(json!({ "ok": true }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "plan.createBlock" => Some(create_block(conn, params)),
        "plan.createUnit" => Some(create_unit(conn, params)),
        "plan.createInstance" => Some(create_instance(conn, params)),
        "plan.assignPerson" => Some(assign_person(conn, params)),
        "plan.assignGroup" => Some(assign_group(conn, params)),
        "plan.assignRoom" => Some(assign_room(conn, params)),
        "plan.createBooking" => Some(create_booking(conn, params)),
        "plan.checkIn" => Some(check_in(conn, params)),
        "plan.registerParticipant" => Some(register_participant(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("plan.") {
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
