//! In-memory executor.
//!
//! Schemas, tables and rows live in ordinary maps; rows are JSON objects.
//! `begin` snapshots the whole state and `rollback` restores it, so DDL is
//! transactional here just as it is in PostgreSQL.
//!
//! Fault hooks let callers reproduce failures the engine must survive:
//! rejected inserts, rows appearing out-of-band before verification,
//! missing DDL privilege and engines without schemas.
//!
//! The tenant directory is modelled by `public.tenants`, which exists from
//! the start with the default directory columns.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{CopyBatch, Database, TenantColumn};
use crate::error::{DbError, DbResult};
use crate::ident::{Ident, QualifiedTable};
use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter, TenantId};

/// A stored row.
pub type Row = Map<String, Value>;

type TableKey = (String, String);

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    primary_key: Vec<String>,
    indexes: BTreeSet<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Default)]
struct State {
    namespaces: BTreeSet<String>,
    grants: BTreeSet<(String, String)>,
    tables: BTreeMap<TableKey, MemTable>,
    tenants: BTreeMap<TenantId, Tenant>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_inserts: BTreeSet<TableKey>,
    planted: Vec<(TableKey, Row)>,
    deny_ddl: bool,
    no_namespaces: bool,
}

/// In-process executor and tenant directory.
#[derive(Debug)]
pub struct MemoryStore {
    state: State,
    snapshot: Option<State>,
    faults: Faults,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(table: &QualifiedTable) -> TableKey {
    (table.schema.to_string(), table.table.to_string())
}

fn tenant_value(tenant: TenantId) -> Value {
    Value::from(tenant.0)
}

fn matches(row: &Row, filter: Option<&TenantColumn>) -> bool {
    filter.is_none_or(|f| row.get(f.column.as_str()) == Some(&tenant_value(f.tenant)))
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn compare_rows(a: &Row, b: &Row, order_by: &[Ident]) -> Ordering {
    for column in order_by {
        let ord = compare_values(
            a.get(column.as_str()).unwrap_or(&Value::Null),
            b.get(column.as_str()).unwrap_or(&Value::Null),
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project(row: &Row, columns: &[Ident]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c.as_str()).cloned().unwrap_or(Value::Null))
        .collect()
}

impl MemoryStore {
    /// Empty store with the `public` schema and the `public.tenants` directory table.
    pub fn new() -> Self {
        let mut state = State::default();
        state.namespaces.insert("public".to_string());
        state.tables.insert(
            ("public".to_string(), "tenants".to_string()),
            MemTable {
                columns: ["id", "slug", "migration_status", "schema_name"]
                    .map(String::from)
                    .to_vec(),
                primary_key: vec!["id".to_string()],
                ..MemTable::default()
            },
        );
        Self {
            state,
            snapshot: None,
            faults: Faults::default(),
        }
    }

    /// Create a schema.
    pub fn with_namespace(mut self, name: &str) -> Self {
        self.state.namespaces.insert(name.to_string());
        self
    }

    /// Create a table (and its schema, if needed).
    pub fn with_table(mut self, schema: &str, table: &str, columns: &[&str], primary_key: &[&str]) -> Self {
        self.state.namespaces.insert(schema.to_string());
        self.state.tables.insert(
            (schema.to_string(), table.to_string()),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                ..MemTable::default()
            },
        );
        self
    }

    /// Append rows to an existing table. Non-object values are ignored.
    pub fn with_rows(mut self, schema: &str, table: &str, rows: impl IntoIterator<Item = Value>) -> Self {
        for row in rows {
            // Setup helper: unknown tables simply receive nothing.
            let _ = self.insert_row(schema, table, row);
        }
        self
    }

    /// Register a tenant in the directory.
    pub fn with_tenant(mut self, tenant: Tenant) -> Self {
        self.state.tenants.insert(tenant.id, tenant);
        self
    }

    /// Insert one row directly, bypassing the engine.
    pub fn insert_row(&mut self, schema: &str, table: &str, row: Value) -> DbResult<()> {
        let Value::Object(row) = row else {
            return Err(DbError::Rejected("rows must be JSON objects".to_string()));
        };
        let name = format!("{schema}.{table}");
        let target = self
            .state
            .tables
            .get_mut(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| DbError::MissingTable(name.clone()))?;
        Self::append(target, &name, vec![row])
    }

    /// Remove a table (e.g. to simulate a missing metadata table).
    pub fn drop_table(&mut self, schema: &str, table: &str) {
        self.state.tables.remove(&(schema.to_string(), table.to_string()));
    }

    /// Make every non-empty insert into `schema.table` fail.
    pub fn fail_inserts_into(&mut self, schema: &str, table: &str) {
        self.faults
            .failing_inserts
            .insert((schema.to_string(), table.to_string()));
    }

    /// Append `row` right after the next successful copy into `schema.table`,
    /// as if another writer had inserted it concurrently.
    pub fn plant_row_after_copy(&mut self, schema: &str, table: &str, row: Value) {
        if let Value::Object(row) = row {
            self.faults
                .planted
                .push(((schema.to_string(), table.to_string()), row));
        }
    }

    /// Refuse schema creation, as for a role without CREATE on the database.
    pub fn deny_ddl(&mut self) {
        self.faults.deny_ddl = true;
    }

    /// Report that the engine has no named schemas.
    pub fn without_namespace_support(&mut self) {
        self.faults.no_namespaces = true;
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.namespaces.contains(name)
    }

    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.state
            .tables
            .contains_key(&(schema.to_string(), table.to_string()))
    }

    pub fn rows(&self, schema: &str, table: &str) -> Option<&[Row]> {
        self.state
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.rows.as_slice())
    }

    pub fn columns_of(&self, schema: &str, table: &str) -> Option<&[String]> {
        self.state
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.columns.as_slice())
    }

    pub fn has_index(&self, schema: &str, table: &str, index: &str) -> bool {
        self.state
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .is_some_and(|t| t.indexes.contains(index))
    }

    pub fn is_granted(&self, namespace: &str, role: &str) -> bool {
        self.state
            .grants
            .contains(&(namespace.to_string(), role.to_string()))
    }

    pub fn tenant(&self, id: i64) -> Option<&Tenant> {
        self.state.tenants.get(&TenantId(id))
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn table(&self, table: &QualifiedTable) -> DbResult<&MemTable> {
        self.state
            .tables
            .get(&key(table))
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn table_mut(&mut self, table: &QualifiedTable) -> DbResult<&mut MemTable> {
        self.state
            .tables
            .get_mut(&key(table))
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn require_namespace(&self, namespace: &Ident) -> DbResult<()> {
        if self.state.namespaces.contains(namespace.as_str()) {
            Ok(())
        } else {
            Err(DbError::MissingNamespace(namespace.to_string()))
        }
    }

    /// Insert rows enforcing known columns and primary key uniqueness.
    fn append(target: &mut MemTable, name: &str, rows: Vec<Row>) -> DbResult<()> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        if !target.primary_key.is_empty() {
            for existing in &target.rows {
                seen.insert(Self::pk_of(existing, &target.primary_key));
            }
        }

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(unknown) = row.keys().find(|k| !target.columns.contains(k)) {
                return Err(DbError::Rejected(format!(
                    "column {unknown:?} of relation {name} does not exist"
                )));
            }
            if !target.primary_key.is_empty() {
                let pk = Self::pk_of(&row, &target.primary_key);
                if !seen.insert(pk.clone()) {
                    return Err(DbError::Rejected(format!(
                        "duplicate key value {pk} violates primary key of {name}"
                    )));
                }
            }
            let mut full = Row::new();
            for column in &target.columns {
                full.insert(
                    column.clone(),
                    row.get(column).cloned().unwrap_or(Value::Null),
                );
            }
            prepared.push(full);
        }
        target.rows.extend(prepared);
        Ok(())
    }

    fn pk_of(row: &Row, primary_key: &[String]) -> String {
        let values: Vec<&Value> = primary_key
            .iter()
            .map(|c| row.get(c).unwrap_or(&Value::Null))
            .collect();
        serde_json::to_string(&values).unwrap_or_default()
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn begin(&mut self) -> DbResult<()> {
        if self.snapshot.is_some() {
            return Err(DbError::Rejected(
                "there is already a transaction in progress".to_string(),
            ));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
        }
        Ok(())
    }

    async fn server_version(&mut self) -> DbResult<String> {
        Ok(format!("qail-tenant memory store {}", env!("CARGO_PKG_VERSION")))
    }

    async fn supports_namespaces(&mut self) -> DbResult<bool> {
        Ok(!self.faults.no_namespaces)
    }

    async fn namespace_exists(&mut self, namespace: &Ident) -> DbResult<bool> {
        Ok(self.state.namespaces.contains(namespace.as_str()))
    }

    async fn create_namespace(&mut self, namespace: &Ident) -> DbResult<()> {
        if self.faults.deny_ddl {
            return Err(DbError::Rejected(
                "permission denied for database".to_string(),
            ));
        }
        self.state.namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn grant_namespace(&mut self, namespace: &Ident, role: &Ident) -> DbResult<()> {
        self.require_namespace(namespace)?;
        self.state
            .grants
            .insert((namespace.to_string(), role.to_string()));
        Ok(())
    }

    async fn drop_namespace(&mut self, namespace: &Ident, cascade: bool) -> DbResult<()> {
        if !self.state.namespaces.contains(namespace.as_str()) {
            return Ok(());
        }
        let owned: Vec<TableKey> = self
            .state
            .tables
            .keys()
            .filter(|(schema, _)| schema == namespace.as_str())
            .cloned()
            .collect();
        if !owned.is_empty() && !cascade {
            return Err(DbError::Rejected(format!(
                "cannot drop schema {namespace} because other objects depend on it"
            )));
        }
        for table in owned {
            self.state.tables.remove(&table);
        }
        self.state.grants.retain(|(ns, _)| ns != namespace.as_str());
        self.state.namespaces.remove(namespace.as_str());
        Ok(())
    }

    async fn table_exists(&mut self, table: &QualifiedTable) -> DbResult<bool> {
        Ok(self.state.tables.contains_key(&key(table)))
    }

    async fn columns(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>> {
        self.table(table)?
            .columns
            .iter()
            .map(|c| Ident::new(c.clone()).map_err(|_| DbError::Identifier(c.clone())))
            .collect()
    }

    async fn primary_key(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>> {
        self.table(table)?
            .primary_key
            .iter()
            .map(|c| Ident::new(c.clone()).map_err(|_| DbError::Identifier(c.clone())))
            .collect()
    }

    async fn clone_structure(
        &mut self,
        source: &QualifiedTable,
        dest: &QualifiedTable,
        without: Option<&Ident>,
    ) -> DbResult<()> {
        self.require_namespace(&dest.schema)?;
        if self.state.tables.contains_key(&key(dest)) {
            return Ok(());
        }
        let src = self.table(source)?;
        let keep = |c: &String| without.is_none_or(|w| w.as_str() != c);
        let cloned = MemTable {
            columns: src.columns.iter().filter(|c| keep(*c)).cloned().collect(),
            primary_key: src.primary_key.iter().filter(|c| keep(*c)).cloned().collect(),
            ..MemTable::default()
        };
        self.state.tables.insert(key(dest), cloned);
        Ok(())
    }

    async fn add_discriminator(&mut self, table: &QualifiedTable, column: &Ident) -> DbResult<()> {
        let target = self.table_mut(table)?;
        if !target.columns.iter().any(|c| c == column.as_str()) {
            target.columns.push(column.to_string());
            for row in &mut target.rows {
                row.insert(column.to_string(), Value::Null);
            }
        }
        target
            .indexes
            .insert(format!("{}_{}_index", table.table, column));
        Ok(())
    }

    async fn count_rows(
        &mut self,
        table: &QualifiedTable,
        filter: Option<&TenantColumn>,
    ) -> DbResult<i64> {
        let count = self
            .table(table)?
            .rows
            .iter()
            .filter(|row| matches(row, filter))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn copy_batch(&mut self, batch: &CopyBatch<'_>) -> DbResult<u64> {
        let offset = usize::try_from(batch.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(batch.limit).unwrap_or(usize::MAX);

        let source = self.table(batch.source)?;
        let mut selected: Vec<&Row> = source
            .rows
            .iter()
            .filter(|row| matches(row, batch.filter))
            .collect();
        selected.sort_by(|a, b| compare_rows(a, b, batch.order_by));

        let page: Vec<Row> = selected
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                let mut out = Row::new();
                for column in batch.columns {
                    out.insert(
                        column.to_string(),
                        row.get(column.as_str()).cloned().unwrap_or(Value::Null),
                    );
                }
                if let Some(attach) = batch.attach {
                    out.insert(attach.column.to_string(), tenant_value(attach.tenant));
                }
                out
            })
            .collect();

        let dest_key = key(batch.dest);
        if !page.is_empty() && self.faults.failing_inserts.contains(&dest_key) {
            return Err(DbError::Rejected(format!(
                "insert into {} rejected",
                batch.dest
            )));
        }

        let copied = page.len();
        let name = batch.dest.to_string();
        let dest = self.table_mut(batch.dest)?;
        Self::append(dest, &name, page)?;

        let (planted, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.faults.planted)
            .into_iter()
            .partition(|(k, _)| *k == dest_key);
        self.faults.planted = rest;
        if !planted.is_empty() {
            let dest = self.table_mut(batch.dest)?;
            Self::append(dest, &name, planted.into_iter().map(|(_, row)| row).collect())?;
        }

        Ok(copied as u64)
    }

    async fn delete_rows(
        &mut self,
        table: &QualifiedTable,
        filter: &TenantColumn,
    ) -> DbResult<u64> {
        let target = self.table_mut(table)?;
        let before = target.rows.len();
        target.rows.retain(|row| !matches(row, Some(filter)));
        Ok((before - target.rows.len()) as u64)
    }

    async fn checksum(
        &mut self,
        table: &QualifiedTable,
        columns: &[Ident],
        filter: Option<&TenantColumn>,
    ) -> DbResult<String> {
        let mut encoded: Vec<String> = self
            .table(table)?
            .rows
            .iter()
            .filter(|row| matches(row, filter))
            .map(|row| serde_json::to_string(&project(row, columns)).unwrap_or_default())
            .collect();
        encoded.sort();
        Ok(format!("{:x}", md5::compute(encoded.join("|"))))
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn list_tenants(&mut self, filter: &TenantFilter) -> DbResult<Vec<Tenant>> {
        let tenants = self.state.tenants.values();
        Ok(match filter {
            TenantFilter::All => tenants.cloned().collect(),
            TenantFilter::Unmigrated => tenants
                .filter(|t| t.status != MigrationStatus::Migrated)
                .cloned()
                .collect(),
            TenantFilter::Ids(ids) => tenants.filter(|t| ids.contains(&t.id)).cloned().collect(),
        })
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> DbResult<()> {
        match self.state.tenants.get_mut(&tenant.id) {
            Some(existing) => {
                *existing = tenant.clone();
                Ok(())
            }
            None => Err(DbError::Rejected(format!("tenant {} not found", tenant.id))),
        }
    }
}
