//! Bookable items: services, products, packages. Appointments reference
//! exactly one variant through [`ItemRef`]. The product stock ledger lives
//! here; stock only moves at confirmation time, never at booking.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::history;
use crate::models::enums::{HistoryAction, ItemKind};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub price: Option<f64>,
    pub duration_minutes: i64,
    pub category: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Option<f64>,
    pub stock: i64,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub price: Option<f64>,
    pub sessions: i64,
    pub duration_days: i64,
    pub grace_period_days: i64,
    pub archived: bool,
}

/// Tagged reference to exactly one catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ItemRef {
    Service(String),
    Product(String),
    Package(String),
}

impl ItemRef {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemRef::Service(_) => ItemKind::Service,
            ItemRef::Product(_) => ItemKind::Product,
            ItemRef::Package(_) => ItemKind::Package,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ItemRef::Service(id) | ItemRef::Product(id) | ItemRef::Package(id) => id,
        }
    }
}

/// Admission-relevant view of an item, independent of variant.
#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    pub kind: ItemKind,
    pub name: String,
    pub archived: bool,
    /// Only products carry stock.
    pub stock: Option<i64>,
}

// ─── Repository ─────────────────────────────────────────────────────────────

pub fn create_service(
    conn: &Connection,
    name: &str,
    price: Option<f64>,
    duration_minutes: i64,
    category: Option<&str>,
) -> Result<Service, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO services (id, name, price, duration_minutes, category, archived)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![id, name, price, duration_minutes, category],
    )?;
    get_service(conn, &id)?.ok_or(DatabaseError::NotFound {
        entity_type: "service".into(),
        id,
    })
}

pub fn get_service(conn: &Connection, id: &str) -> Result<Option<Service>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, price, duration_minutes, category, archived
             FROM services WHERE id = ?1",
            params![id],
            |row| {
                Ok(Service {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                    duration_minutes: row.get(3)?,
                    category: row.get(4)?,
                    archived: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn create_product(
    conn: &Connection,
    name: &str,
    price: Option<f64>,
    stock: i64,
) -> Result<Product, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO products (id, name, price, stock, archived) VALUES (?1, ?2, ?3, ?4, 0)",
        params![id, name, price, stock],
    )?;
    get_product(conn, &id)?.ok_or(DatabaseError::NotFound {
        entity_type: "product".into(),
        id,
    })
}

pub fn get_product(conn: &Connection, id: &str) -> Result<Option<Product>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, price, stock, archived FROM products WHERE id = ?1",
            params![id],
            |row| {
                Ok(Product {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                    stock: row.get(3)?,
                    archived: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn create_package(
    conn: &Connection,
    name: &str,
    price: Option<f64>,
    sessions: i64,
    duration_days: i64,
    grace_period_days: i64,
) -> Result<Package, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO packages (id, name, price, sessions, duration_days, grace_period_days, archived)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![id, name, price, sessions, duration_days, grace_period_days],
    )?;
    get_package(conn, &id)?.ok_or(DatabaseError::NotFound {
        entity_type: "package".into(),
        id,
    })
}

pub fn get_package(conn: &Connection, id: &str) -> Result<Option<Package>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, price, sessions, duration_days, grace_period_days, archived
             FROM packages WHERE id = ?1",
            params![id],
            |row| {
                Ok(Package {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                    sessions: row.get(3)?,
                    duration_days: row.get(4)?,
                    grace_period_days: row.get(5)?,
                    archived: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Resolve an [`ItemRef`] to its admission snapshot.
pub fn item_snapshot(conn: &Connection, item: &ItemRef) -> Result<ItemSnapshot, DatabaseError> {
    match item {
        ItemRef::Service(id) => get_service(conn, id)?
            .map(|s| ItemSnapshot {
                kind: ItemKind::Service,
                name: s.name,
                archived: s.archived,
                stock: None,
            })
            .ok_or(DatabaseError::NotFound {
                entity_type: "service".into(),
                id: id.clone(),
            }),
        ItemRef::Product(id) => get_product(conn, id)?
            .map(|p| ItemSnapshot {
                kind: ItemKind::Product,
                name: p.name,
                archived: p.archived,
                stock: Some(p.stock),
            })
            .ok_or(DatabaseError::NotFound {
                entity_type: "product".into(),
                id: id.clone(),
            }),
        ItemRef::Package(id) => get_package(conn, id)?
            .map(|p| ItemSnapshot {
                kind: ItemKind::Package,
                name: p.name,
                archived: p.archived,
                stock: None,
            })
            .ok_or(DatabaseError::NotFound {
                entity_type: "package".into(),
                id: id.clone(),
            }),
    }
}

pub fn item_name(conn: &Connection, item: &ItemRef) -> Result<String, DatabaseError> {
    Ok(item_snapshot(conn, item)?.name)
}

// ─── Stock ledger ───────────────────────────────────────────────────────────

/// Take one unit of stock. Returns false (and changes nothing) when the
/// product is already at zero.
pub fn try_reserve_stock(
    conn: &Connection,
    product_id: &str,
    actor: &str,
    now: NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE products SET stock = stock - 1 WHERE id = ?1 AND stock > 0",
        params![product_id],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    let product = get_product(conn, product_id)?.ok_or(DatabaseError::NotFound {
        entity_type: "product".into(),
        id: product_id.into(),
    })?;
    history::append(
        conn,
        HistoryAction::Edit,
        "product",
        product_id,
        &product.name,
        actor,
        serde_json::json!({ "stock_change": -1, "stock": product.stock }),
        now,
    )?;
    Ok(true)
}

/// Return one unit of stock (future return paths).
pub fn release_stock(
    conn: &Connection,
    product_id: &str,
    actor: &str,
    now: NaiveDateTime,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE products SET stock = stock + 1 WHERE id = ?1",
        params![product_id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "product".into(),
            id: product_id.into(),
        });
    }
    let product = get_product(conn, product_id)?.ok_or(DatabaseError::NotFound {
        entity_type: "product".into(),
        id: product_id.into(),
    })?;
    history::append(
        conn,
        HistoryAction::Edit,
        "product",
        product_id,
        &product.name,
        actor,
        serde_json::json!({ "stock_change": 1, "stock": product.stock }),
        now,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn item_snapshot_resolves_each_variant() {
        let conn = open_memory_database().unwrap();
        let service = create_service(&conn, "Diamond Peel", Some(1500.0), 60, Some("Facial")).unwrap();
        let product = create_product(&conn, "Sunblock SPF50", Some(800.0), 3).unwrap();
        let package = create_package(&conn, "Glow Package", Some(6000.0), 4, 90, 90).unwrap();

        let s = item_snapshot(&conn, &ItemRef::Service(service.id)).unwrap();
        assert_eq!(s.kind, ItemKind::Service);
        assert_eq!(s.stock, None);

        let p = item_snapshot(&conn, &ItemRef::Product(product.id)).unwrap();
        assert_eq!(p.kind, ItemKind::Product);
        assert_eq!(p.stock, Some(3));

        let k = item_snapshot(&conn, &ItemRef::Package(package.id)).unwrap();
        assert_eq!(k.name, "Glow Package");
    }

    #[test]
    fn unknown_item_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = item_snapshot(&conn, &ItemRef::Service("ghost".into())).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn reserve_stock_stops_at_zero() {
        let conn = open_memory_database().unwrap();
        let product = create_product(&conn, "Serum", None, 2).unwrap();

        assert!(try_reserve_stock(&conn, &product.id, "staff", now()).unwrap());
        assert!(try_reserve_stock(&conn, &product.id, "staff", now()).unwrap());
        assert!(!try_reserve_stock(&conn, &product.id, "staff", now()).unwrap());

        let stock = get_product(&conn, &product.id).unwrap().unwrap().stock;
        assert_eq!(stock, 0);
    }

    #[test]
    fn stock_moves_are_history_logged() {
        let conn = open_memory_database().unwrap();
        let product = create_product(&conn, "Serum", None, 1).unwrap();
        try_reserve_stock(&conn, &product.id, "staff", now()).unwrap();
        release_stock(&conn, &product.id, "staff", now()).unwrap();

        let entries = history::recent_for_kind(&conn, "product", 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(get_product(&conn, &product.id).unwrap().unwrap().stock, 1);
    }
}
