use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn str_array(req: &Request, key: &str) -> Result<Vec<String>, serde_json::Value> {
    let Some(raw) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", format!("missing {}", key), None));
    };
    let mut out = Vec::new();
    for v in raw {
        let Some(s) = v.as_str() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} must contain only strings", key),
                None,
            ));
        };
        out.push(s.to_string());
    }
    Ok(out)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Look up a person id passed under `key` and require the given role. The
/// identity itself is trusted (resolved upstream); only role and existence
/// are checked here.
pub fn require_role(
    conn: &Connection,
    req: &Request,
    key: &str,
    role: &str,
) -> Result<String, serde_json::Value> {
    let person_id = required_str(req, key)?;
    let found: Option<String> = conn
        .query_row("SELECT role FROM people WHERE id = ?", [&person_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    match found {
        None => Err(err(
            &req.id,
            "not_found",
            "person not found",
            Some(json!({ "personId": person_id })),
        )),
        Some(r) if r != role => Err(err(
            &req.id,
            "forbidden",
            format!("requires {} role", role),
            Some(json!({ "personId": person_id, "role": r })),
        )),
        Some(_) => Ok(person_id),
    }
}

pub fn is_enrolled(
    conn: &Connection,
    course_id: &str,
    person_id: &str,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrolments WHERE course_id = ? AND person_id = ?",
            (course_id, person_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
