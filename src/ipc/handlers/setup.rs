use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, new_id, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn create_organization(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let enabled = params
        .get("schedulingEnabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let id = new_id();
    conn.execute(
        "INSERT INTO organizations(id, name, scheduling_enabled) VALUES(?, ?, ?)",
        (&id, &name, enabled as i64),
    )
    .map_err(|e| HandlerErr::db_update(e, "organizations"))?;
    Ok(json!({ "organizationId": id }))
}

fn create_term(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = new_id();
    conn.execute("INSERT INTO terms(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(|e| HandlerErr::db_update(e, "terms"))?;
    Ok(json!({ "termId": id }))
}

fn create_room(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = new_id();
    conn.execute("INSERT INTO rooms(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(|e| HandlerErr::db_update(e, "rooms"))?;
    Ok(json!({ "roomId": id }))
}

fn create_person(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO persons(id, display_name) VALUES(?, ?)",
        (&id, &display_name),
    )
    .map_err(|e| HandlerErr::db_update(e, "persons"))?;
    Ok(json!({ "personId": id }))
}

fn create_group(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let parent_id = get_optional_str(params, "parentId");
    let id = new_id();
    conn.execute(
        "INSERT INTO study_groups(id, name, parent_id) VALUES(?, ?, ?)",
        (&id, &name, &parent_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "study_groups"))?;
    Ok(json!({ "groupId": id }))
}

fn create_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let code = get_required_str(params, "code")?;
    let title = get_required_str(params, "title")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, group_id, code, title) VALUES(?, ?, ?, ?)",
        (&id, &group_id, &code, &title),
    )
    .map_err(|e| HandlerErr::db_update(e, "subjects"))?;
    Ok(json!({ "subjectId": id }))
}

fn create_event(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let title = get_required_str(params, "title")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO events(id, code, title) VALUES(?, ?, ?)",
        (&id, &code, &title),
    )
    .map_err(|e| HandlerErr::db_update(e, "events"))?;
    Ok(json!({ "eventId": id }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "setup.createOrganization" => Some(create_organization(conn, params)),
        "setup.createTerm" => Some(create_term(conn, params)),
        "setup.createRoom" => Some(create_room(conn, params)),
        "setup.createPerson" => Some(create_person(conn, params)),
        "setup.createGroup" => Some(create_group(conn, params)),
        "setup.createSubject" => Some(create_subject(conn, params)),
        "setup.createEvent" => Some(create_event(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("setup.") {
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
