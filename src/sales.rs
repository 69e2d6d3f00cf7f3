//! Sale recording for Caja POS.
//!
//! Creates one sale per invoice: the invoice number comes from a single
//! atomic counter upsert, so two registers can never draw the same number;
//! the sale and its line items commit
//! together, and the inventory side effects (kardex journal, movement log,
//! stock decrement) run afterwards best effort: a failure there is logged
//! and swallowed, the sale stands.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthState};
use crate::counting::CURRENCY;
use crate::db::{self, DbState};
use crate::reconciliation;

/// One cart line, parsed from the command payload.
#[derive(Debug, Clone)]
struct SaleItem {
    product_id: String,
    quantity: f64,
    unit_price: f64,
    unit_cost: f64,
}

// ---------------------------------------------------------------------------
// Invoice numbering
// ---------------------------------------------------------------------------

/// Draw the next invoice number for the branch.
///
/// A single upsert under SQLite's write lock: creates the counter at 1 on
/// first use, increments it otherwise, and returns the drawn number in the
/// same statement.
pub fn next_invoice_number(
    conn: &rusqlite::Connection,
    org_id: &str,
    branch_id: &str,
) -> Result<i64, String> {
    conn.query_row(
        "INSERT INTO invoice_counters (org_id, branch_id, last_number, updated_at)
         VALUES (?1, ?2, 1, datetime('now'))
         ON CONFLICT(org_id, branch_id) DO UPDATE SET
            last_number = last_number + 1,
            updated_at = excluded.updated_at
         RETURNING last_number",
        params![org_id, branch_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("next invoice number: {e}"))
}

// ---------------------------------------------------------------------------
// Sale creation
// ---------------------------------------------------------------------------

/// Record a sale from the cart payload.
///
/// Expected JSON shape (camelCase):
/// ```json
/// {
///   "clientId": "...",          // optional
///   "clientName": "...",        // optional, defaults to Cliente General
///   "discount": 0,
///   "items": [{ "productId": "...", "quantity": 1, "price": 10.0, "cost": 6.0 }]
/// }
/// ```
pub fn create_sale(
    db: &DbState,
    auth_state: &AuthState,
    org_id: &str,
    branch_id: &str,
    payload: &Value,
) -> Result<Value, String> {
    let items = parse_items(payload)?;
    if items.is_empty() {
        return Err("Agrega productos al carrito".into());
    }

    let discount = num_field(payload, "discount").unwrap_or(0.0).max(0.0);
    let client_id = str_field(payload, "clientId");
    let client_name =
        str_field(payload, "clientName").unwrap_or_else(|| "Cliente General".to_string());
    let user_id = auth::current_session(auth_state).map(|s| s.user_id);

    let subtotal: f64 = items.iter().map(|i| i.unit_price * i.quantity).sum();
    let total = subtotal - discount;
    let margin: f64 = items
        .iter()
        .map(|i| (i.unit_price - i.unit_cost) * i.quantity)
        .sum();

    let sale_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let today = reconciliation::today();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let factura = next_invoice_number(&conn, org_id, branch_id)?.to_string();

    // Sale + items + sync staging are all-or-nothing.
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO sales (
                id, org_id, branch_id, client_id, client_name, user_id,
                fecha, subtotal, descuento, iva, total, margen, factura,
                status, payment_method, amount_paid, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12,
                      'PAGADA', 'EFECTIVO', ?10, ?13)",
            params![
                sale_id,
                org_id,
                branch_id,
                client_id,
                client_name,
                user_id,
                today,
                subtotal,
                discount,
                total,
                margin,
                factura,
                now,
            ],
        )
        .map_err(|e| format!("insert sale: {e}"))?;

        for item in &items {
            conn.execute(
                "INSERT INTO sales_items (org_id, sale_id, product_id, quantity, price, cost, subtotal)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    org_id,
                    sale_id,
                    item.product_id,
                    item.quantity,
                    item.unit_price,
                    item.unit_cost,
                    item.unit_price * item.quantity,
                ],
            )
            .map_err(|e| format!("insert sale item: {e}"))?;
        }

        db::enqueue_sync(
            &conn,
            "sale",
            &sale_id,
            "insert",
            &serde_json::json!({
                "saleId": sale_id,
                "factura": factura,
                "total": total,
                "itemCount": items.len(),
            }),
        )?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    // Inventory side effects: logged and swallowed, the sale stands.
    record_inventory_side_effects(
        &conn,
        org_id,
        branch_id,
        &factura,
        user_id.as_deref(),
        &items,
    );

    info!(sale_id = %sale_id, factura = %factura, total = %total, "Sale recorded");

    Ok(serde_json::json!({
        "success": true,
        "saleId": sale_id,
        "factura": factura,
        "total": total,
        "message": format!("Factura #{factura} registrada por {CURRENCY} {total:.2}"),
    }))
}

/// Kardex journal, movement log, and stock decrement for each sold item.
/// Every failure here is a warning, never an error to the caller.
fn record_inventory_side_effects(
    conn: &rusqlite::Connection,
    org_id: &str,
    branch_id: &str,
    factura: &str,
    user_id: Option<&str>,
    items: &[SaleItem],
) {
    let reference = format!("Factura #{factura}");

    for item in items {
        if let Err(e) = conn.execute(
            "INSERT INTO kardex (
                org_id, product_id, branch_id, movement_type, reference,
                quantity, cost_unit, total, created_by, from_branch, to_branch
            ) VALUES (?1, ?2, ?3, 'SALE', ?4, ?5, ?6, ?7, ?8, ?3, NULL)",
            params![
                org_id,
                item.product_id,
                branch_id,
                reference,
                -item.quantity,
                item.unit_cost,
                (item.unit_cost * item.quantity).abs(),
                user_id,
            ],
        ) {
            warn!(product_id = %item.product_id, "Kardex entry failed: {e}");
        }

        if let Err(e) = conn.execute(
            "INSERT INTO inventory_movements (
                org_id, product_id, type, qty, from_branch, to_branch,
                cost, price, reference, created_by
            ) VALUES (?1, ?2, 'salida', ?3, ?4, NULL, ?5, ?6, ?7, ?8)",
            params![
                org_id,
                item.product_id,
                item.quantity,
                branch_id,
                item.unit_cost,
                item.unit_price,
                reference,
                user_id,
            ],
        ) {
            warn!(product_id = %item.product_id, "Inventory movement failed: {e}");
        }

        if let Err(e) = conn.execute(
            "UPDATE current_stock SET stock = stock - ?1, updated_at = datetime('now')
             WHERE product_id = ?2 AND branch_id = ?3",
            params![item.quantity, item.product_id, branch_id],
        ) {
            warn!(product_id = %item.product_id, "Stock decrement failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn parse_items(payload: &Value) -> Result<Vec<SaleItem>, String> {
    let raw = match payload.get("items") {
        Some(Value::Array(arr)) => arr,
        Some(_) => return Err("Invalid items payload".into()),
        None => return Ok(Vec::new()),
    };

    let mut items = Vec::with_capacity(raw.len());
    for entry in raw {
        let product_id = str_field(entry, "productId")
            .or_else(|| str_field(entry, "product_id"))
            .ok_or("Missing productId on cart item")?;
        let quantity = num_field(entry, "quantity").unwrap_or(0.0);
        if quantity <= 0.0 {
            return Err(format!("Invalid quantity for product {product_id}"));
        }
        items.push(SaleItem {
            product_id,
            quantity,
            unit_price: num_field(entry, "price")
                .or_else(|| num_field(entry, "unitPrice"))
                .unwrap_or(0.0),
            unit_cost: num_field(entry, "cost")
                .or_else(|| num_field(entry, "unitCost"))
                .unwrap_or(0.0),
        });
    }
    Ok(items)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const ORG: &str = "org-1";
    const BRANCH: &str = "branch-1";

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn cart_payload() -> Value {
        serde_json::json!({
            "clientName": "Maria Lopez",
            "discount": 5.0,
            "items": [
                { "productId": "p-1", "quantity": 2.0, "price": 50.0, "cost": 30.0 },
                { "productId": "p-2", "quantity": 1.0, "price": 25.5, "cost": 10.0 },
            ],
        })
    }

    #[test]
    fn invoice_numbers_are_sequential_per_branch() {
        let db = test_db();
        let conn = db.conn.lock().expect("db lock");

        assert_eq!(next_invoice_number(&conn, ORG, BRANCH).expect("first"), 1);
        assert_eq!(next_invoice_number(&conn, ORG, BRANCH).expect("second"), 2);
        assert_eq!(next_invoice_number(&conn, ORG, BRANCH).expect("third"), 3);

        // Another branch counts on its own
        assert_eq!(
            next_invoice_number(&conn, ORG, "otra-sucursal").expect("other branch"),
            1
        );
        assert_eq!(next_invoice_number(&conn, ORG, BRANCH).expect("fourth"), 4);
    }

    #[test]
    fn sale_commits_with_items_and_sync_entry() {
        let db = test_db();
        let auth_state = AuthState::new();

        let resp =
            create_sale(&db, &auth_state, ORG, BRANCH, &cart_payload()).expect("create sale");
        assert_eq!(resp["factura"], "1");
        assert_eq!(resp["total"], 120.5);

        let conn = db.conn.lock().expect("db lock");
        let (total, descuento, margen): (f64, f64, f64) = conn
            .query_row(
                "SELECT total, descuento, margen FROM sales WHERE factura = '1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("sale row");
        assert_eq!(total, 120.5);
        assert_eq!(descuento, 5.0);
        assert_eq!(margen, 55.5);

        let items: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales_items", [], |r| r.get(0))
            .expect("items");
        assert_eq!(items, 2);

        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'sale'",
                [],
                |r| r.get(0),
            )
            .expect("sync");
        assert_eq!(queued, 1);
    }

    #[test]
    fn empty_cart_is_rejected_without_drawing_a_number() {
        let db = test_db();
        let auth_state = AuthState::new();

        let err = create_sale(
            &db,
            &auth_state,
            ORG,
            BRANCH,
            &serde_json::json!({ "items": [] }),
        )
        .expect_err("empty cart");
        assert_eq!(err, "Agrega productos al carrito");

        let conn = db.conn.lock().expect("db lock");
        let counters: i64 = conn
            .query_row("SELECT COUNT(*) FROM invoice_counters", [], |r| r.get(0))
            .expect("counters");
        assert_eq!(counters, 0);
    }

    #[test]
    fn stock_is_decremented_for_sold_items() {
        let db = test_db();
        let auth_state = AuthState::new();
        {
            let conn = db.conn.lock().expect("db lock");
            conn.execute(
                "INSERT INTO current_stock (org_id, branch_id, product_id, name, price, cost, stock)
                 VALUES (?1, ?2, 'p-1', 'Cafe molido', 50.0, 30.0, 10.0)",
                params![ORG, BRANCH],
            )
            .expect("seed stock");
        }

        create_sale(&db, &auth_state, ORG, BRANCH, &cart_payload()).expect("create sale");

        let conn = db.conn.lock().expect("db lock");
        let stock: f64 = conn
            .query_row(
                "SELECT stock FROM current_stock WHERE product_id = 'p-1'",
                [],
                |r| r.get(0),
            )
            .expect("stock");
        assert_eq!(stock, 8.0);

        let kardex_qty: f64 = conn
            .query_row(
                "SELECT quantity FROM kardex WHERE product_id = 'p-1'",
                [],
                |r| r.get(0),
            )
            .expect("kardex");
        assert_eq!(kardex_qty, -2.0, "kardex records sales as negative quantity");
    }

    #[test]
    fn inventory_side_effect_failure_does_not_fail_the_sale() {
        let db = test_db();
        let auth_state = AuthState::new();
        {
            let conn = db.conn.lock().expect("db lock");
            conn.execute_batch("DROP TABLE kardex; DROP TABLE inventory_movements;")
                .expect("sabotage side tables");
        }

        let resp = create_sale(&db, &auth_state, ORG, BRANCH, &cart_payload())
            .expect("sale still succeeds");
        assert_eq!(resp["success"], true);

        let conn = db.conn.lock().expect("db lock");
        let sales: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales", [], |r| r.get(0))
            .expect("sales");
        assert_eq!(sales, 1);
    }
}
