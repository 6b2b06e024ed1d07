//! Actor tables (farmers, suppliers, industries, consumers)
//!
//! Each actor kind has its own table with kind-specific columns. The
//! [`ActorKindStore`] trait gives every kind the same lookup surface so the
//! identity registry can dispatch by kind instead of branching per table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::models::{format_timestamp, ActorType};
use super::ts_col;
use crate::error::{db_err, LedgerError};

/// Uniform view of any actor, whatever table it lives in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub actor_type: ActorType,
    pub name: Option<String>,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

/// Registration input, tagged by actor kind
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "actorType", rename_all_fields = "camelCase")]
pub enum RegisterActorInput {
    Farmer {
        name: String,
        phone: String,
        #[serde(default)]
        village: Option<String>,
        #[serde(default)]
        district: Option<String>,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        approved: bool,
    },
    Supplier {
        name: String,
        phone: String,
        #[serde(default)]
        business_name: Option<String>,
        #[serde(default)]
        district: Option<String>,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        approved: bool,
    },
    Industry {
        industry_name: String,
        phone: String,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        license_number: Option<String>,
        #[serde(default)]
        approved: bool,
    },
    Consumer {
        #[serde(default)]
        name: Option<String>,
        phone: String,
    },
}

impl RegisterActorInput {
    pub fn actor_type(&self) -> ActorType {
        match self {
            RegisterActorInput::Farmer { .. } => ActorType::Farmer,
            RegisterActorInput::Supplier { .. } => ActorType::Supplier,
            RegisterActorInput::Industry { .. } => ActorType::Industry,
            RegisterActorInput::Consumer { .. } => ActorType::Consumer,
        }
    }

    pub fn phone(&self) -> &str {
        match self {
            RegisterActorInput::Farmer { phone, .. }
            | RegisterActorInput::Supplier { phone, .. }
            | RegisterActorInput::Industry { phone, .. }
            | RegisterActorInput::Consumer { phone, .. } => phone,
        }
    }
}

/// Storage for one actor kind
pub trait ActorKindStore: Send + Sync {
    fn kind(&self) -> ActorType;

    fn get(&self, conn: &Connection, id: &str) -> Result<Option<Actor>, LedgerError>;

    fn find_by_phone(&self, conn: &Connection, phone: &str) -> Result<Option<Actor>, LedgerError>;

    /// Insert a new record; `input` must be of this table's kind
    fn insert(
        &self,
        conn: &Connection,
        id: &str,
        input: &RegisterActorInput,
        created_at: &DateTime<Utc>,
    ) -> Result<(), LedgerError>;
}

fn query_actor(
    conn: &Connection,
    sql: &str,
    key: &str,
    from_row: fn(&Row) -> Result<Actor, rusqlite::Error>,
) -> Result<Option<Actor>, LedgerError> {
    conn.query_row(sql, params![key], from_row)
        .optional()
        .map_err(db_err("Actor query failed"))
}

fn join_address(parts: &[Option<String>]) -> Option<String> {
    let joined: Vec<&str> = parts.iter().filter_map(|p| p.as_deref()).collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(", "))
    }
}

fn wrong_kind(expected: ActorType, input: &RegisterActorInput) -> LedgerError {
    LedgerError::Internal(format!(
        "{} table cannot store {} registration",
        expected,
        input.actor_type()
    ))
}

// ============================================================================
// Farmers
// ============================================================================

pub struct FarmerStore;

impl FarmerStore {
    fn from_row(row: &Row) -> Result<Actor, rusqlite::Error> {
        Ok(Actor {
            id: row.get("id")?,
            actor_type: ActorType::Farmer,
            name: row.get("name")?,
            phone: row.get("phone")?,
            email: None,
            address: join_address(&[row.get("village")?, row.get("district")?, row.get("state")?]),
            approved: row.get::<_, i64>("is_approved")? != 0,
            created_at: ts_col(row, "created_at")?,
        })
    }
}

impl ActorKindStore for FarmerStore {
    fn kind(&self) -> ActorType {
        ActorType::Farmer
    }

    fn get(&self, conn: &Connection, id: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM farmers WHERE id = ?", id, Self::from_row)
    }

    fn find_by_phone(&self, conn: &Connection, phone: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM farmers WHERE phone = ? LIMIT 1", phone, Self::from_row)
    }

    fn insert(
        &self,
        conn: &Connection,
        id: &str,
        input: &RegisterActorInput,
        created_at: &DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let RegisterActorInput::Farmer { name, phone, village, district, state, approved } = input
        else {
            return Err(wrong_kind(ActorType::Farmer, input));
        };

        conn.execute(
            "INSERT INTO farmers (id, name, phone, village, district, state, is_approved, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![id, name, phone, village, district, state, *approved as i64, format_timestamp(created_at)],
        )
        .map_err(db_err("Farmer insert failed"))?;
        Ok(())
    }
}

// ============================================================================
// Suppliers
// ============================================================================

pub struct SupplierStore;

impl SupplierStore {
    fn from_row(row: &Row) -> Result<Actor, rusqlite::Error> {
        Ok(Actor {
            id: row.get("id")?,
            actor_type: ActorType::Supplier,
            name: row.get("name")?,
            phone: row.get("phone")?,
            email: None,
            address: join_address(&[row.get("district")?, row.get("state")?]),
            approved: row.get::<_, i64>("is_approved")? != 0,
            created_at: ts_col(row, "created_at")?,
        })
    }
}

impl ActorKindStore for SupplierStore {
    fn kind(&self) -> ActorType {
        ActorType::Supplier
    }

    fn get(&self, conn: &Connection, id: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM suppliers WHERE id = ?", id, Self::from_row)
    }

    fn find_by_phone(&self, conn: &Connection, phone: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM suppliers WHERE phone = ? LIMIT 1", phone, Self::from_row)
    }

    fn insert(
        &self,
        conn: &Connection,
        id: &str,
        input: &RegisterActorInput,
        created_at: &DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let RegisterActorInput::Supplier { name, phone, business_name, district, state, approved } =
            input
        else {
            return Err(wrong_kind(ActorType::Supplier, input));
        };

        conn.execute(
            "INSERT INTO suppliers (id, name, phone, business_name, district, state, is_approved, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![id, name, phone, business_name, district, state, *approved as i64, format_timestamp(created_at)],
        )
        .map_err(db_err("Supplier insert failed"))?;
        Ok(())
    }
}

// ============================================================================
// Industries
// ============================================================================

pub struct IndustryStore;

impl IndustryStore {
    fn from_row(row: &Row) -> Result<Actor, rusqlite::Error> {
        Ok(Actor {
            id: row.get("id")?,
            actor_type: ActorType::Industry,
            name: row.get("industry_name")?,
            phone: row.get("phone")?,
            email: row.get("email")?,
            address: row.get("address")?,
            approved: row.get::<_, i64>("is_approved")? != 0,
            created_at: ts_col(row, "created_at")?,
        })
    }
}

impl ActorKindStore for IndustryStore {
    fn kind(&self) -> ActorType {
        ActorType::Industry
    }

    fn get(&self, conn: &Connection, id: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM industries WHERE id = ?", id, Self::from_row)
    }

    fn find_by_phone(&self, conn: &Connection, phone: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM industries WHERE phone = ? LIMIT 1", phone, Self::from_row)
    }

    fn insert(
        &self,
        conn: &Connection,
        id: &str,
        input: &RegisterActorInput,
        created_at: &DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let RegisterActorInput::Industry {
            industry_name,
            phone,
            email,
            address,
            license_number,
            approved,
        } = input
        else {
            return Err(wrong_kind(ActorType::Industry, input));
        };

        conn.execute(
            "INSERT INTO industries (id, industry_name, phone, email, address, license_number, is_approved, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                industry_name,
                phone,
                email,
                address,
                license_number,
                *approved as i64,
                format_timestamp(created_at)
            ],
        )
        .map_err(db_err("Industry insert failed"))?;
        Ok(())
    }
}

// ============================================================================
// Consumers
// ============================================================================

pub struct ConsumerStore;

impl ConsumerStore {
    fn from_row(row: &Row) -> Result<Actor, rusqlite::Error> {
        Ok(Actor {
            id: row.get("id")?,
            actor_type: ActorType::Consumer,
            name: row.get("name")?,
            phone: row.get("phone")?,
            email: None,
            address: None,
            // Consumers need no approval to scan
            approved: true,
            created_at: ts_col(row, "created_at")?,
        })
    }
}

impl ActorKindStore for ConsumerStore {
    fn kind(&self) -> ActorType {
        ActorType::Consumer
    }

    fn get(&self, conn: &Connection, id: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM consumers WHERE id = ?", id, Self::from_row)
    }

    fn find_by_phone(&self, conn: &Connection, phone: &str) -> Result<Option<Actor>, LedgerError> {
        query_actor(conn, "SELECT * FROM consumers WHERE phone = ? LIMIT 1", phone, Self::from_row)
    }

    fn insert(
        &self,
        conn: &Connection,
        id: &str,
        input: &RegisterActorInput,
        created_at: &DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let RegisterActorInput::Consumer { name, phone } = input else {
            return Err(wrong_kind(ActorType::Consumer, input));
        };

        conn.execute(
            "INSERT INTO consumers (id, name, phone, created_at) VALUES (?, ?, ?, ?)",
            params![id, name, phone, format_timestamp(created_at)],
        )
        .map_err(db_err("Consumer insert failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_farmer_insert_and_lookup() {
        let conn = conn();
        let input = RegisterActorInput::Farmer {
            name: "Ramesh".into(),
            phone: "9000000001".into(),
            village: Some("Hosur".into()),
            district: None,
            state: Some("Karnataka".into()),
            approved: true,
        };
        FarmerStore.insert(&conn, "FRM-1", &input, &Utc::now()).unwrap();

        let farmer = FarmerStore.get(&conn, "FRM-1").unwrap().unwrap();
        assert_eq!(farmer.name.as_deref(), Some("Ramesh"));
        assert_eq!(farmer.address.as_deref(), Some("Hosur, Karnataka"));
        assert!(farmer.approved);

        let by_phone = FarmerStore.find_by_phone(&conn, "9000000001").unwrap().unwrap();
        assert_eq!(by_phone.id, "FRM-1");
    }

    #[test]
    fn test_table_rejects_other_kind() {
        let conn = conn();
        let input = RegisterActorInput::Consumer { name: None, phone: "1".into() };
        let err = IndustryStore.insert(&conn, "IND-1", &input, &Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::Internal(_)));
    }

    #[test]
    fn test_registration_json_is_tagged_by_kind() {
        let input: RegisterActorInput = serde_json::from_str(
            r#"{"actorType":"Industry","industryName":"Vedic Labs","phone":"9","approved":true}"#,
        )
        .unwrap();
        assert_eq!(input.actor_type(), ActorType::Industry);
        assert_eq!(input.phone(), "9");
    }
}
