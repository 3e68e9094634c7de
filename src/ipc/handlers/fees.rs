use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_bool, get_opt_str, get_required_str, now_iso, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::{paid_total_cents, PaymentStatus};

fn get_required_cents(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let cents = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {} (integer cents)", key)))?;
    if cents < 0 {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key)));
    }
    Ok(cents)
}

fn fee_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let family_id = get_required_str(params, "familyId")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let amount_due_cents = get_required_cents(params, "amountDueCents")?;
    let label = get_opt_str(params, "label");

    if !row_exists(conn, "SELECT 1 FROM families WHERE id = ?", &family_id)? {
        return Err(HandlerErr::not_found("family not found"));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO fees(id, family_id, academic_year, label, amount_due_cents, is_active,
                          created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &family_id,
            &academic_year,
            &label,
            amount_due_cents,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "fees"))?;
    Ok(json!({ "feeId": id }))
}

fn fee_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if !row_exists(conn, "SELECT 1 FROM fees WHERE id = ?", &fee_id)? {
        return Err(HandlerErr::not_found("fee not found"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    for (key, value) in patch {
        match key.as_str() {
            "label" => {
                sets.push("label = ?");
                binds.push(match value.as_str() {
                    Some(s) => rusqlite::types::Value::Text(s.to_string()),
                    None if value.is_null() => rusqlite::types::Value::Null,
                    None => return Err(HandlerErr::bad_params("label must be string or null")),
                });
            }
            "amountDueCents" => {
                let cents = value
                    .as_i64()
                    .filter(|c| *c >= 0)
                    .ok_or_else(|| {
                        HandlerErr::bad_params("amountDueCents must be a non-negative integer")
                    })?;
                sets.push("amount_due_cents = ?");
                binds.push(rusqlite::types::Value::Integer(cents));
            }
            "active" => {
                let active = value
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?;
                sets.push("is_active = ?");
                binds.push(rusqlite::types::Value::Integer(active as i64));
            }
            other => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown patch field: {}",
                    other
                )))
            }
        }
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("empty patch"));
    }

    sets.push("updated_at = ?");
    binds.push(rusqlite::types::Value::Text(now_iso()));
    binds.push(rusqlite::types::Value::Text(fee_id.clone()));
    let sql = format!("UPDATE fees SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(|e| HandlerErr::update(e, "fees"))?;
    Ok(json!({ "feeId": fee_id }))
}

fn add_payment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let amount_paid_cents = get_required_cents(params, "amountPaidCents")?;
    let method = get_opt_str(params, "method");
    let paid_at = get_opt_str(params, "paidAt").unwrap_or_else(now_iso);

    let amount_due_cents: i64 = conn
        .query_row(
            "SELECT amount_due_cents FROM fees WHERE id = ?",
            [&fee_id],
            |r| r.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("fee not found"),
            other => HandlerErr::query(other),
        })?;

    let payment_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "fee_payments"))?;
    tx.execute(
        "INSERT INTO fee_payments(id, fee_id, amount_paid_cents, method, paid_at)
         VALUES(?, ?, ?, ?, ?)",
        (&payment_id, &fee_id, amount_paid_cents, &method, &paid_at),
    )
    .map_err(|e| HandlerErr::update(e, "fee_payments"))?;
    tx.execute(
        "UPDATE fees SET updated_at = ? WHERE id = ?",
        (now_iso(), &fee_id),
    )
    .map_err(|e| HandlerErr::update(e, "fees"))?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "fee_payments"))?;

    let paid: Vec<i64> = collect_payments(conn, &fee_id)?;
    let paid_total = paid_total_cents(&paid);
    Ok(json!({
        "paymentId": payment_id,
        "paidTotalCents": paid_total,
        "paymentStatus": PaymentStatus::classify(amount_due_cents, paid_total),
    }))
}

fn add_note(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let note = get_required_str(params, "note")?;
    if !row_exists(conn, "SELECT 1 FROM fees WHERE id = ?", &fee_id)? {
        return Err(HandlerErr::not_found("fee not found"));
    }
    let note_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_notes(id, fee_id, note, created_at) VALUES(?, ?, ?, ?)",
        (&note_id, &fee_id, &note, now_iso()),
    )
    .map_err(|e| HandlerErr::update(e, "fee_notes"))?;
    Ok(json!({ "noteId": note_id }))
}

fn collect_payments(conn: &Connection, fee_id: &str) -> Result<Vec<i64>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT amount_paid_cents FROM fee_payments WHERE fee_id = ?")
        .map_err(HandlerErr::query)?;
    stmt.query_map([fee_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn list_by_family(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let family_id = get_required_str(params, "familyId")?;
    let active_only = get_bool(params, "activeOnly", true);
    if !row_exists(conn, "SELECT 1 FROM families WHERE id = ?", &family_id)? {
        return Err(HandlerErr::not_found("family not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, academic_year, label, amount_due_cents, is_active, created_at, updated_at
             FROM fees
             WHERE family_id = ? AND (is_active = 1 OR ? = 0)
             ORDER BY academic_year, created_at",
        )
        .map_err(HandlerErr::query)?;
    let fee_rows: Vec<(String, String, Option<String>, i64, bool, Option<String>, Option<String>)> =
        stmt.query_map((&family_id, active_only as i64), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get::<_, i64>(4)? != 0,
                r.get(5)?,
                r.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut payment_stmt = conn
        .prepare(
            "SELECT id, amount_paid_cents, method, paid_at FROM fee_payments
             WHERE fee_id = ? ORDER BY paid_at",
        )
        .map_err(HandlerErr::query)?;
    let mut note_stmt = conn
        .prepare(
            "SELECT id, note, created_at FROM fee_notes WHERE fee_id = ? ORDER BY created_at",
        )
        .map_err(HandlerErr::query)?;

    let mut fees = Vec::with_capacity(fee_rows.len());
    let mut family_due = 0i64;
    let mut family_paid = 0i64;
    for (id, academic_year, label, amount_due_cents, active, created_at, updated_at) in fee_rows {
        let payments: Vec<serde_json::Value> = payment_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "amountPaidCents": r.get::<_, i64>(1)?,
                    "method": r.get::<_, Option<String>>(2)?,
                    "paidAt": r.get::<_, Option<String>>(3)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        let notes: Vec<serde_json::Value> = note_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "note": r.get::<_, String>(1)?,
                    "createdAt": r.get::<_, Option<String>>(2)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;

        let amounts: Vec<i64> = payments
            .iter()
            .filter_map(|p| p["amountPaidCents"].as_i64())
            .collect();
        let paid_total = paid_total_cents(&amounts);
        family_due += amount_due_cents;
        family_paid += paid_total;

        fees.push(json!({
            "id": id,
            "academicYear": academic_year,
            "label": label,
            "amountDueCents": amount_due_cents,
            "paidTotalCents": paid_total,
            "paymentStatus": PaymentStatus::classify(amount_due_cents, paid_total),
            "active": active,
            "createdAt": created_at,
            "updatedAt": updated_at,
            "payments": payments,
            "notes": notes,
        }));
    }

    Ok(json!({
        "familyId": family_id,
        "fees": fees,
        "totalDueCents": family_due,
        "totalPaidCents": family_paid,
        "paymentStatus": PaymentStatus::classify(family_due, family_paid),
    }))
}

fn with_conn<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.create" => Some(with_conn(state, req, fee_create)),
        "fees.update" => Some(with_conn(state, req, fee_update)),
        "fees.addPayment" => Some(with_conn(state, req, add_payment)),
        "fees.addNote" => Some(with_conn(state, req, add_note)),
        "fees.listByFamily" => Some(with_conn(state, req, list_by_family)),
        _ => None,
    }
}
