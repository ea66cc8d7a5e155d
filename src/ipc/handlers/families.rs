use crate::billing::{resolve_family_name, FamilyNameParts};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_i64, now_rfc3339, opt_trimmed};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

/// JSON param name -> families column.
const NAME_FIELDS: [(&str, &str); 6] = [
    ("fatherChineseName", "father_chinese_name"),
    ("motherChineseName", "mother_chinese_name"),
    ("fatherFirstName", "father_first_name"),
    ("fatherLastName", "father_last_name"),
    ("motherFirstName", "mother_first_name"),
    ("motherLastName", "mother_last_name"),
];

const MAX_NAME_LEN: usize = 80;

fn name_value(value: Option<&Value>, key: &str) -> Result<Option<String>, String> {
    let v = opt_trimmed(value, key)?;
    if let Some(s) = &v {
        if s.chars().count() > MAX_NAME_LEN {
            return Err(format!("{} length must be <= {}", key, MAX_NAME_LEN));
        }
    }
    Ok(v)
}

fn name_param(params: &Value, key: &str) -> Result<Option<String>, String> {
    name_value(params.get(key), key)
}

fn family_exists(conn: &Connection, family_id: i64) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM families WHERE id = ?", [family_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn handle_families_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "families": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           f.id,
           f.father_chinese_name,
           f.mother_chinese_name,
           f.father_first_name,
           f.father_last_name,
           f.mother_first_name,
           f.mother_last_name,
           (SELECT COUNT(*) FROM students s WHERE s.family_id = f.id) AS student_count
         FROM families f
         ORDER BY f.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let family_id: i64 = row.get(0)?;
            let parts = FamilyNameParts {
                father_chinese_name: row.get(1)?,
                mother_chinese_name: row.get(2)?,
                father_first_name: row.get(3)?,
                father_last_name: row.get(4)?,
                mother_first_name: row.get(5)?,
                mother_last_name: row.get(6)?,
            };
            let student_count: i64 = row.get(7)?;
            Ok(json!({
                "familyId": family_id,
                "displayName": resolve_family_name(&parts),
                "nameParts": parts,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(families) => ok(&req.id, json!({ "families": families })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_families_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut values: Vec<Option<String>> = Vec::with_capacity(NAME_FIELDS.len());
    for (key, _) in NAME_FIELDS {
        match name_param(&req.params, key) {
            Ok(v) => values.push(v),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }
    let parts = FamilyNameParts {
        father_chinese_name: values[0].clone(),
        mother_chinese_name: values[1].clone(),
        father_first_name: values[2].clone(),
        father_last_name: values[3].clone(),
        mother_first_name: values[4].clone(),
        mother_last_name: values[5].clone(),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO families(
           father_chinese_name, mother_chinese_name,
           father_first_name, father_last_name,
           mother_first_name, mother_last_name,
           updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &parts.father_chinese_name,
            &parts.mother_chinese_name,
            &parts.father_first_name,
            &parts.father_last_name,
            &parts.mother_first_name,
            &parts.mother_last_name,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "families" })),
        );
    }

    let family_id = conn.last_insert_rowid();
    ok(
        &req.id,
        json!({ "familyId": family_id, "displayName": resolve_family_name(&parts) }),
    )
}

fn handle_families_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(family_id) = get_i64(&req.params, "familyId") else {
        return err(&req.id, "bad_params", "missing familyId", None);
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Option<String>> = Vec::new();
    for (key, raw) in patch {
        let Some((_, column)) = NAME_FIELDS.iter().find(|(k, _)| k == key) else {
            return err(&req.id, "bad_params", format!("unknown family field: {}", key), None);
        };
        match name_value(Some(raw), key) {
            Ok(v) => {
                sets.push(*column);
                values.push(v);
            }
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    match family_exists(conn, family_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "family not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let assignments = sets
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE families SET {}, updated_at = ? WHERE id = ?",
        assignments
    );
    let mut bind: Vec<rusqlite::types::Value> = values
        .into_iter()
        .map(|v| match v {
            Some(s) => rusqlite::types::Value::Text(s),
            None => rusqlite::types::Value::Null,
        })
        .collect();
    bind.push(rusqlite::types::Value::Text(now_rfc3339()));
    bind.push(rusqlite::types::Value::Integer(family_id));

    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(bind)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(family_id) = get_i64(&req.params, "familyId") else {
        return err(&req.id, "bad_params", "missing familyId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, chinese_name, first_name, last_name, sort_order
         FROM students
         WHERE family_id = ?
         ORDER BY sort_order, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([family_id], |row| {
            let id: String = row.get(0)?;
            let chinese_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let last_name: String = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "chineseName": chinese_name,
                "firstName": first_name,
                "lastName": last_name,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(family_id) = get_i64(&req.params, "familyId") else {
        return err(&req.id, "bad_params", "missing familyId", None);
    };

    let mut names: Vec<String> = Vec::with_capacity(3);
    for key in ["chineseName", "firstName", "lastName"] {
        match name_param(&req.params, key) {
            Ok(v) => names.push(v.unwrap_or_default()),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }
    if names.iter().all(|n| n.is_empty()) {
        return err(&req.id, "bad_params", "student needs at least one name", None);
    }

    match family_exists(conn, family_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "family not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE family_id = ?",
        [family_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, family_id, chinese_name, first_name, last_name, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            family_id,
            &names[0],
            &names[1],
            &names[2],
            next_sort,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": next_sort }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "families.list" => Some(handle_families_list(state, req)),
        "families.create" => Some(handle_families_create(state, req)),
        "families.update" => Some(handle_families_update(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        _ => None,
    }
}
