use chrono::{NaiveDate, NaiveTime};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

/// Validated form of one uploaded schedule export. The external system sends
/// a complete picture of everything currently planned for (organization,
/// term); ids are opaque strings assigned elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedSnapshot {
    pub creation_date: String,
    pub creation_time: String,
    pub term_id: String,
    pub instances: BTreeMap<String, BTreeMap<String, PersonResources>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersonResources {
    pub groups: Vec<String>,
    pub rooms: Vec<String>,
}

impl ParsedSnapshot {
    /// Timestamp attributed to the reconciliation pass for this snapshot.
    pub fn pass_stamp(&self) -> String {
        format!("{} {}", self.creation_date, self.creation_time)
    }

    /// Canonical JSON form stored in schedule_snapshots.payload.
    pub fn to_payload(&self) -> serde_json::Value {
        let instances: serde_json::Map<String, serde_json::Value> = self
            .instances
            .iter()
            .map(|(instance_id, persons)| {
                let persons_json: serde_json::Map<String, serde_json::Value> = persons
                    .iter()
                    .map(|(person_id, res)| {
                        (
                            person_id.clone(),
                            serde_json::json!({
                                "groups": res.groups,
                                "rooms": res.rooms,
                            }),
                        )
                    })
                    .collect();
                (
                    instance_id.clone(),
                    serde_json::Value::Object(persons_json),
                )
            })
            .collect();
        serde_json::json!({
            "creationDate": self.creation_date,
            "creationTime": self.creation_time,
            "termId": self.term_id,
            "instances": serde_json::Value::Object(instances),
        })
    }
}

/// Converts a raw upload payload into a `ParsedSnapshot`. All problems are
/// collected; on failure the caller gets the full issue list and no partial
/// structure.
pub fn validate_payload(raw: &serde_json::Value) -> Result<ParsedSnapshot, Vec<String>> {
    let mut issues: Vec<String> = Vec::new();

    let Some(obj) = raw.as_object() else {
        return Err(vec!["payload must be an object".to_string()]);
    };

    let creation_date = match obj.get("creationDate").and_then(|v| v.as_str()) {
        Some(s) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => s.to_string(),
        Some(s) => {
            issues.push(format!("creationDate: expected YYYY-MM-DD, got '{}'", s));
            String::new()
        }
        None => {
            issues.push("creationDate: missing or not a string".to_string());
            String::new()
        }
    };
    let creation_time = match obj.get("creationTime").and_then(|v| v.as_str()) {
        Some(s) if NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok() => s.to_string(),
        Some(s) => {
            issues.push(format!("creationTime: expected HH:MM:SS, got '{}'", s));
            String::new()
        }
        None => {
            issues.push("creationTime: missing or not a string".to_string());
            String::new()
        }
    };
    let term_id = match obj.get("termId").and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => {
            issues.push("termId: must not be empty".to_string());
            String::new()
        }
        None => {
            issues.push("termId: missing or not a string".to_string());
            String::new()
        }
    };

    let mut instances: BTreeMap<String, BTreeMap<String, PersonResources>> = BTreeMap::new();
    match obj.get("instances") {
        Some(serde_json::Value::Object(map)) => {
            for (instance_id, persons_val) in map {
                let Some(persons_map) = persons_val.as_object() else {
                    issues.push(format!(
                        "instances.{}: expected an object of person entries",
                        instance_id
                    ));
                    continue;
                };
                let mut persons: BTreeMap<String, PersonResources> = BTreeMap::new();
                for (person_id, res_val) in persons_map {
                    let path = format!("instances.{}.{}", instance_id, person_id);
                    let Some(res_obj) = res_val.as_object() else {
                        issues.push(format!("{}: expected an object", path));
                        continue;
                    };
                    let groups = collect_id_list(res_obj.get("groups"), &path, "groups", &mut issues);
                    let rooms = collect_id_list(res_obj.get("rooms"), &path, "rooms", &mut issues);
                    persons.insert(person_id.clone(), PersonResources { groups, rooms });
                }
                instances.insert(instance_id.clone(), persons);
            }
        }
        Some(_) => issues.push("instances: expected an object".to_string()),
        None => issues.push("instances: missing".to_string()),
    }

    if !issues.is_empty() {
        return Err(issues);
    }
    Ok(ParsedSnapshot {
        creation_date,
        creation_time,
        term_id,
        instances,
    })
}

fn collect_id_list(
    v: Option<&serde_json::Value>,
    path: &str,
    key: &str,
    issues: &mut Vec<String>,
) -> Vec<String> {
    let Some(v) = v else { return Vec::new() };
    let Some(arr) = v.as_array() else {
        issues.push(format!("{}.{}: expected an array of ids", path, key));
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        match item.as_str() {
            Some(s) if !s.is_empty() => out.push(s.to_string()),
            _ => issues.push(format!("{}.{}[{}]: expected a string id", path, key, i)),
        }
    }
    out
}

/// Persists a validated snapshot as an immutable row and returns its id.
pub fn store(conn: &Connection, org_id: &str, snap: &ParsedSnapshot) -> rusqlite::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schedule_snapshots(id, org_id, term_id, creation_date, creation_time, payload)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            org_id,
            &snap.term_id,
            &snap.creation_date,
            &snap.creation_time,
            snap.to_payload().to_string(),
        ),
    )?;
    Ok(id)
}

/// Ids of previously stored snapshots for (org, term), oldest first. The
/// caller pops the last as the reference; an empty list means first import.
pub fn prior_snapshots(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
    exclude_id: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM schedule_snapshots
         WHERE org_id = ? AND term_id = ? AND id != ?
         ORDER BY creation_date, creation_time, rowid",
    )?;
    let ids = stmt
        .query_map((org_id, term_id, exclude_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Retention: at most one stored snapshot per organization/term/day.
pub fn prune_same_day(
    conn: &Connection,
    org_id: &str,
    term_id: &str,
    creation_date: &str,
    keep_id: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM schedule_snapshots
         WHERE org_id = ? AND term_id = ? AND creation_date = ? AND id != ?",
        (org_id, term_id, creation_date, keep_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_accepts_full_payload() {
        let raw = json!({
            "creationDate": "2026-03-02",
            "creationTime": "04:30:00",
            "termId": "term-1",
            "instances": {
                "inst-1": {
                    "pers-1": { "groups": ["g1", "g2"], "rooms": ["r1"] },
                    "pers-2": {}
                },
                "inst-2": {}
            }
        });
        let snap = validate_payload(&raw).expect("valid payload");
        assert_eq!(snap.term_id, "term-1");
        assert_eq!(snap.pass_stamp(), "2026-03-02 04:30:00");
        assert_eq!(snap.instances.len(), 2);
        let pers = &snap.instances["inst-1"];
        assert_eq!(pers["pers-1"].groups, vec!["g1", "g2"]);
        assert_eq!(pers["pers-1"].rooms, vec!["r1"]);
        assert!(pers["pers-2"].groups.is_empty());
    }

    #[test]
    fn validate_collects_every_issue() {
        let raw = json!({
            "creationDate": "03/02/2026",
            "termId": "",
            "instances": {
                "inst-1": { "pers-1": { "groups": ["g1", 7] } },
                "inst-2": "oops"
            }
        });
        let issues = validate_payload(&raw).expect_err("invalid payload");
        assert!(issues.iter().any(|m| m.starts_with("creationDate:")));
        assert!(issues.iter().any(|m| m.starts_with("creationTime:")));
        assert!(issues.iter().any(|m| m.starts_with("termId:")));
        assert!(issues
            .iter()
            .any(|m| m.contains("instances.inst-1.pers-1.groups[1]")));
        assert!(issues.iter().any(|m| m.contains("instances.inst-2")));
    }

    #[test]
    fn validate_rejects_non_object_payload() {
        let issues = validate_payload(&json!([1, 2])).expect_err("not an object");
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn canonical_payload_round_trips() {
        let raw = json!({
            "creationDate": "2026-03-02",
            "creationTime": "04:30:00",
            "termId": "term-1",
            "instances": { "inst-1": { "pers-1": { "rooms": ["r1"] } } }
        });
        let snap = validate_payload(&raw).expect("valid payload");
        let canon = snap.to_payload();
        let again = validate_payload(&canon).expect("canonical form validates");
        assert_eq!(again.to_payload(), canon);
    }
}
