//! Logical table references and backend-specific physical naming.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Schemas that are never tenant-prefixed by the remote backend.
pub const PROTECTED_SCHEMAS: &[&str] = &["information_schema"];

/// Separator between the logical schema and table root in a flattened
/// physical table name.
pub const SCHEMA_SEP: &str = "____";

/// A schema-qualified logical table reference.
///
/// The user-visible name (`schema.table_root`) is stable across backends;
/// the physical name a backend stores data under is computed by a
/// [`NamePolicy`]. Equality and hashing use the user-visible name only.
///
/// `table_opts` carries free-form metadata (description, source, connection)
/// that ends up in the catalog when the table is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHandle {
    schema: String,
    table_root: String,
    #[serde(default)]
    table_opts: BTreeMap<String, String>,
}

impl TableHandle {
    /// Build a handle from a table root and an explicit schema.
    ///
    /// Exactly one way of naming the schema must be used: either the root is
    /// a dotted `schema.table` and `schema` is `None`, or the root is bare
    /// and `schema` is given. Anything else is an error.
    pub fn new(table_root: &str, schema: Option<&str>) -> Result<Self, CoreError> {
        match schema {
            Some(schema) => {
                if table_root.contains('.') {
                    return Err(CoreError::Config(format!(
                        "cannot provide qualified table {} and schema {}",
                        table_root, schema
                    )));
                }
                Ok(Self {
                    schema: schema.to_string(),
                    table_root: table_root.to_string(),
                    table_opts: BTreeMap::new(),
                })
            }
            None => {
                let (schema, root) = table_root.split_once('.').ok_or_else(|| {
                    CoreError::Config(format!(
                        "unqualified table {} provided but no schema",
                        table_root
                    ))
                })?;
                Ok(Self {
                    schema: schema.to_string(),
                    table_root: root.to_string(),
                    table_opts: BTreeMap::new(),
                })
            }
        }
    }

    /// Parse a qualified `schema.table` string.
    pub fn parse(qualified: &str) -> Result<Self, CoreError> {
        Self::new(qualified, None)
    }

    pub fn with_opts(mut self, opts: BTreeMap<String, String>) -> Self {
        self.table_opts = opts;
        self
    }

    pub fn set_opt(&mut self, key: &str, value: &str) {
        self.table_opts.insert(key.to_string(), value.to_string());
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table_root(&self) -> &str {
        &self.table_root
    }

    pub fn table_opts(&self) -> &BTreeMap<String, String> {
        &self.table_opts
    }

    /// The stable, backend-independent qualified name.
    pub fn user_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_root)
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table_root)
    }
}

impl PartialEq for TableHandle {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.table_root == other.table_root
    }
}

impl Eq for TableHandle {}

impl std::hash::Hash for TableHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.schema.hash(state);
        self.table_root.hash(state);
    }
}

/// How a backend projects a logical table name into its physical storage name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePolicy {
    /// Physical name == logical name (embedded engine).
    Passthrough,
    /// All schemas except the protected set are flattened into a single
    /// per-tenant namespace, the original schema prefixed onto the table
    /// root with [`SCHEMA_SEP`] (remote multi-tenant engine).
    TenantPrefixed { tenant_db: String },
}

impl NamePolicy {
    pub fn tenant(tenant_id: &str) -> Self {
        NamePolicy::TenantPrefixed {
            tenant_db: format!("tenant_{}", tenant_id),
        }
    }

    /// Compute the physical name for a logical table.
    pub fn physical(&self, table: &TableHandle) -> PhysicalName {
        match self {
            NamePolicy::Passthrough => PhysicalName {
                schema: table.schema().to_string(),
                table_root: table.table_root().to_string(),
            },
            NamePolicy::TenantPrefixed { tenant_db } => {
                if PROTECTED_SCHEMAS.contains(&table.schema()) {
                    PhysicalName {
                        schema: table.schema().to_string(),
                        table_root: table.table_root().to_string(),
                    }
                } else {
                    PhysicalName {
                        schema: tenant_db.clone(),
                        table_root: format!("{}{}{}", table.schema(), SCHEMA_SEP, table.table_root()),
                    }
                }
            }
        }
    }

    /// Recover the logical name from a physical `schema.table` reference,
    /// e.g. from backend error text. Deterministic inverse of [`physical`].
    ///
    /// [`physical`]: NamePolicy::physical
    pub fn logical(&self, physical: &str) -> Result<TableHandle, CoreError> {
        match self {
            NamePolicy::Passthrough => TableHandle::parse(physical),
            NamePolicy::TenantPrefixed { .. } => {
                let root = match physical.split_once('.') {
                    Some((_, root)) => root,
                    None => physical,
                };
                if let Some((schema, table)) = root.split_once(SCHEMA_SEP) {
                    TableHandle::new(table, Some(schema))
                } else {
                    TableHandle::parse(physical)
                }
            }
        }
    }
}

/// The backend-side storage name of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalName {
    pub schema: String,
    pub table_root: String,
}

impl fmt::Display for PhysicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_root_splits() {
        let t = TableHandle::parse("sales.orders").unwrap();
        assert_eq!(t.schema(), "sales");
        assert_eq!(t.table_root(), "orders");
        assert_eq!(t.user_name(), "sales.orders");
    }

    #[test]
    fn test_ambiguous_construction_rejected() {
        assert!(TableHandle::new("sales.orders", Some("sales")).is_err());
    }

    #[test]
    fn test_bare_root_without_schema_rejected() {
        assert!(TableHandle::new("orders", None).is_err());
    }

    #[test]
    fn test_equality_is_user_name() {
        let a = TableHandle::new("orders", Some("sales")).unwrap();
        let b = TableHandle::parse("sales.orders").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_passthrough_physical_name() {
        let t = TableHandle::new("orders", Some("sales")).unwrap();
        let phys = NamePolicy::Passthrough.physical(&t);
        assert_eq!(phys.to_string(), "sales.orders");
    }

    #[test]
    fn test_tenant_prefixed_physical_name() {
        let t = TableHandle::new("orders", Some("sales")).unwrap();
        let phys = NamePolicy::tenant("u42").physical(&t);
        assert_eq!(phys.to_string(), "tenant_u42.sales____orders");
    }

    #[test]
    fn test_protected_schema_not_prefixed() {
        let t = TableHandle::new("tables", Some("information_schema")).unwrap();
        let phys = NamePolicy::tenant("u42").physical(&t);
        assert_eq!(phys.to_string(), "information_schema.tables");
    }

    #[test]
    fn test_physical_round_trip() {
        let policy = NamePolicy::tenant("u42");
        let t = TableHandle::new("orders", Some("sales")).unwrap();
        let phys = policy.physical(&t);
        let back = policy.logical(&phys.to_string()).unwrap();
        assert_eq!(back, t);
    }
}
