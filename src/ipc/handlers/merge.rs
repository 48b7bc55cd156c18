use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, get_str_array, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::merge::{self, MergeError, MergeKind};
use rusqlite::Connection;
use serde_json::json;

fn merge_resources(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role = get_required_str(params, "role")?;
    if role != "admin" {
        return Err(HandlerErr {
            code: "forbidden",
            message: "merging resources requires the admin role".to_string(),
            details: None,
        });
    }
    let kind_raw = get_required_str(params, "kind")?;
    let Some(kind) = MergeKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params(format!(
            "kind must be one of room/event/person/group, got '{}'",
            kind_raw
        )));
    };
    let ids = get_str_array(params, "ids")?;

    match merge::merge(conn, kind, &ids) {
        Ok(outcome) => Ok(json!({
            "merged": true,
            "survivor": outcome.survivor,
            "absorbed": outcome.absorbed,
            "retargetedRows": outcome.retargeted_rows,
            "mergedAssocRows": outcome.merged_assoc_rows,
            "rewrittenSnapshots": outcome.rewritten_snapshots,
            "deletedResources": outcome.deleted_resources,
        })),
        Err(MergeError::BadSelection(message)) => Err(HandlerErr {
            code: "bad_params",
            message,
            details: None,
        }),
        Err(MergeError::Db(_)) => Err(HandlerErr {
            code: "merge_failed",
            message: "merge failed".to_string(),
            details: None,
        }),
    }
}

fn list_resources(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let kind_raw = get_required_str(params, "kind")?;
    let Some(kind) = MergeKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params(format!(
            "kind must be one of room/event/person/group, got '{}'",
            kind_raw
        )));
    };
    let sql = match kind {
        MergeKind::Room => "SELECT id, name, NULL FROM rooms ORDER BY name",
        MergeKind::Person => "SELECT id, display_name, NULL FROM persons ORDER BY display_name",
        MergeKind::Group => "SELECT id, name, parent_id FROM study_groups ORDER BY name",
        MergeKind::Event => "SELECT id, title, subject_id FROM events ORDER BY title",
    };
    let extra_key = match kind {
        MergeKind::Group => "parentId",
        MergeKind::Event => "subjectId",
        _ => "extra",
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([], |r| {
            let mut row = serde_json::Map::new();
            row.insert("id".to_string(), json!(r.get::<_, String>(0)?));
            row.insert("label".to_string(), json!(r.get::<_, String>(1)?));
            row.insert(
                extra_key.to_string(),
                json!(r.get::<_, Option<String>>(2)?),
            );
            Ok(serde_json::Value::Object(row))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "resources": rows }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "resources.merge" => Some(merge_resources(conn, params)),
        "resources.list" => Some(list_resources(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("resources.") {
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
