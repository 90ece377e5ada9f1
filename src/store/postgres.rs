//! PostgreSQL executor.
//!
//! Holds one dedicated connection so explicit `BEGIN`/`COMMIT`/`ROLLBACK`
//! scope every statement of a tenant, including the tenant directory update.
//! Row copies never leave the server: each batch is a single
//! `INSERT ... SELECT ... LIMIT n OFFSET m`.

use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection, Row};
use tracing::debug;

use super::{CopyBatch, Database, TenantColumn};
use crate::error::{DbError, DbResult};
use crate::ident::{Ident, QualifiedTable};
use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter, TenantId};

/// Where the platform keeps its tenants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTable {
    pub table: QualifiedTable,
    pub id_column: Ident,
    pub slug_column: Option<Ident>,
    pub status_column: Ident,
    pub namespace_column: Ident,
}

/// PostgreSQL executor and tenant directory.
pub struct PgStore {
    conn: PgConnection,
    tenants: TenantTable,
}

impl PgStore {
    /// Open a dedicated connection.
    pub async fn connect(url: &str, tenants: TenantTable) -> DbResult<Self> {
        let conn = PgConnection::connect(url).await?;
        Ok(Self { conn, tenants })
    }

    async fn exec(&mut self, sql: &str) -> DbResult<u64> {
        debug!(sql, "execute");
        let done = (&mut self.conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl Database for PgStore {
    async fn begin(&mut self) -> DbResult<()> {
        self.exec("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.exec("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.exec("ROLLBACK").await.map(|_| ())
    }

    async fn server_version(&mut self) -> DbResult<String> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(version)
    }

    async fn supports_namespaces(&mut self) -> DbResult<bool> {
        Ok(self.server_version().await?.contains("PostgreSQL"))
    }

    async fn namespace_exists(&mut self, namespace: &Ident) -> DbResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(namespace.as_str())
        .fetch_one(&mut self.conn)
        .await?;
        Ok(exists)
    }

    async fn create_namespace(&mut self, namespace: &Ident) -> DbResult<()> {
        self.exec(&format!("CREATE SCHEMA IF NOT EXISTS {}", namespace.quoted()))
            .await
            .map(|_| ())
    }

    async fn grant_namespace(&mut self, namespace: &Ident, role: &Ident) -> DbResult<()> {
        for sql in grant_sql(namespace, role) {
            self.exec(&sql).await?;
        }
        Ok(())
    }

    async fn drop_namespace(&mut self, namespace: &Ident, cascade: bool) -> DbResult<()> {
        let mode = if cascade { "CASCADE" } else { "RESTRICT" };
        self.exec(&format!(
            "DROP SCHEMA IF EXISTS {} {}",
            namespace.quoted(),
            mode
        ))
        .await
        .map(|_| ())
    }

    async fn table_exists(&mut self, table: &QualifiedTable) -> DbResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(table.schema.as_str())
        .bind(table.table.as_str())
        .fetch_one(&mut self.conn)
        .await?;
        Ok(exists)
    }

    async fn columns(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 AND is_generated = 'NEVER' \
             ORDER BY ordinal_position",
        )
        .bind(table.schema.as_str())
        .bind(table.table.as_str())
        .fetch_all(&mut self.conn)
        .await?;
        to_idents(names)
    }

    async fn primary_key(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT a.attname::text FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
             ORDER BY array_position(i.indkey::int2[], a.attnum)",
        )
        .bind(table.sql())
        .fetch_all(&mut self.conn)
        .await?;
        to_idents(names)
    }

    async fn clone_structure(
        &mut self,
        source: &QualifiedTable,
        dest: &QualifiedTable,
        without: Option<&Ident>,
    ) -> DbResult<()> {
        for sql in clone_structure_sql(source, dest, without) {
            self.exec(&sql).await?;
        }
        Ok(())
    }

    async fn add_discriminator(&mut self, table: &QualifiedTable, column: &Ident) -> DbResult<()> {
        for sql in add_discriminator_sql(table, column) {
            self.exec(&sql).await?;
        }
        Ok(())
    }

    async fn count_rows(
        &mut self,
        table: &QualifiedTable,
        filter: Option<&TenantColumn>,
    ) -> DbResult<i64> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", table.sql());
        let count: i64 = match filter {
            Some(filter) => {
                sql.push_str(&format!(" WHERE {} = $1", filter.column.quoted()));
                sqlx::query_scalar(&sql)
                    .bind(filter.tenant.0)
                    .fetch_one(&mut self.conn)
                    .await?
            }
            None => sqlx::query_scalar(&sql).fetch_one(&mut self.conn).await?,
        };
        Ok(count)
    }

    async fn copy_batch(&mut self, batch: &CopyBatch<'_>) -> DbResult<u64> {
        let (sql, binds) = copy_batch_sql(batch);
        debug!(sql = %sql, offset = batch.offset, limit = batch.limit, "copy batch");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let done = query.execute(&mut self.conn).await?;
        Ok(done.rows_affected())
    }

    async fn delete_rows(
        &mut self,
        table: &QualifiedTable,
        filter: &TenantColumn,
    ) -> DbResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            table.sql(),
            filter.column.quoted()
        );
        let done = sqlx::query(&sql)
            .bind(filter.tenant.0)
            .execute(&mut self.conn)
            .await?;
        Ok(done.rows_affected())
    }

    async fn checksum(
        &mut self,
        table: &QualifiedTable,
        columns: &[Ident],
        filter: Option<&TenantColumn>,
    ) -> DbResult<String> {
        let sql = checksum_sql(table, columns, filter.map(|f| &f.column));
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if let Some(filter) = filter {
            query = query.bind(filter.tenant.0);
        }
        Ok(query.fetch_one(&mut self.conn).await?)
    }
}

#[async_trait]
impl TenantDirectory for PgStore {
    async fn list_tenants(&mut self, filter: &TenantFilter) -> DbResult<Vec<Tenant>> {
        let sql = list_tenants_sql(&self.tenants, filter);
        let query = sqlx::query(&sql);
        let query = match filter {
            TenantFilter::Ids(ids) => query.bind(ids.iter().map(|id| id.0).collect::<Vec<_>>()),
            TenantFilter::Unmigrated | TenantFilter::All => query,
        };
        let rows = query.fetch_all(&mut self.conn).await?;

        rows.iter()
            .map(|row| -> DbResult<Tenant> {
                let status: Option<String> = row.try_get("status")?;
                Ok(Tenant {
                    id: TenantId(row.try_get("id")?),
                    slug: row.try_get("slug")?,
                    status: status.as_deref().unwrap_or_default().parse()?,
                    namespace: row.try_get("namespace")?,
                })
            })
            .collect()
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> DbResult<()> {
        let t = &self.tenants;
        let sql = format!(
            "UPDATE {} SET {} = $1, {} = $2 WHERE {} = $3",
            t.table.sql(),
            t.status_column.quoted(),
            t.namespace_column.quoted(),
            t.id_column.quoted()
        );
        let done = sqlx::query(&sql)
            .bind(tenant.status.as_str())
            .bind(tenant.namespace.as_deref())
            .bind(tenant.id.0)
            .execute(&mut self.conn)
            .await?;
        if done.rows_affected() == 0 {
            return Err(DbError::Rejected(format!(
                "tenant {} not found in {}",
                tenant.id, t.table
            )));
        }
        Ok(())
    }
}

fn to_idents(names: Vec<String>) -> DbResult<Vec<Ident>> {
    names
        .into_iter()
        .map(|name| Ident::new(name.clone()).map_err(|_| DbError::Identifier(name)))
        .collect()
}

fn grant_sql(namespace: &Ident, role: &Ident) -> Vec<String> {
    let ns = namespace.quoted();
    let role = role.quoted();
    vec![
        format!("GRANT USAGE, CREATE ON SCHEMA {ns} TO {role}"),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {ns} TO {role}"),
        format!("GRANT USAGE, SELECT, UPDATE ON ALL SEQUENCES IN SCHEMA {ns} TO {role}"),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {ns} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {role}"
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {ns} GRANT USAGE, SELECT, UPDATE ON SEQUENCES TO {role}"
        ),
    ]
}

fn clone_structure_sql(
    source: &QualifiedTable,
    dest: &QualifiedTable,
    without: Option<&Ident>,
) -> Vec<String> {
    let mut stmts = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS INCLUDING IDENTITY \
         INCLUDING CONSTRAINTS INCLUDING INDEXES)",
        dest.sql(),
        source.sql()
    )];
    if let Some(column) = without {
        stmts.push(format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            dest.sql(),
            column.quoted()
        ));
    }
    stmts
}

fn add_discriminator_sql(table: &QualifiedTable, column: &Ident) -> Vec<String> {
    let mut index = format!("{}_{}_index", table.table, column);
    index.truncate(Ident::MAX_LEN);
    vec![
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} BIGINT",
            table.sql(),
            column.quoted()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}\" ON {} ({})",
            index,
            table.sql(),
            column.quoted()
        ),
    ]
}

/// SQL plus positional bigint parameters for one copy page.
fn copy_batch_sql(batch: &CopyBatch<'_>) -> (String, Vec<i64>) {
    let mut binds = Vec::new();
    let mut insert_cols: Vec<String> = batch.columns.iter().map(Ident::quoted).collect();
    let mut select_cols = insert_cols.clone();

    if let Some(attach) = batch.attach {
        binds.push(attach.tenant.0);
        insert_cols.push(attach.column.quoted());
        select_cols.push(format!("${}::bigint", binds.len()));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) OVERRIDING SYSTEM VALUE SELECT {} FROM {}",
        batch.dest.sql(),
        insert_cols.join(", "),
        select_cols.join(", "),
        batch.source.sql()
    );

    if let Some(filter) = batch.filter {
        binds.push(filter.tenant.0);
        sql.push_str(&format!(
            " WHERE {} = ${}",
            filter.column.quoted(),
            binds.len()
        ));
    }

    if !batch.order_by.is_empty() {
        let keys: Vec<String> = batch.order_by.iter().map(Ident::quoted).collect();
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }

    sql.push_str(&format!(" LIMIT {} OFFSET {}", batch.limit, batch.offset));
    (sql, binds)
}

fn checksum_sql(table: &QualifiedTable, columns: &[Ident], filter: Option<&Ident>) -> String {
    let cols: Vec<String> = columns.iter().map(Ident::quoted).collect();
    let mut inner = format!("SELECT {} FROM {}", cols.join(", "), table.sql());
    if let Some(column) = filter {
        inner.push_str(&format!(" WHERE {} = $1", column.quoted()));
    }
    format!(
        "SELECT md5(COALESCE(string_agg(r::text, '|' ORDER BY r::text), '')) FROM ({inner}) r"
    )
}

fn list_tenants_sql(t: &TenantTable, filter: &TenantFilter) -> String {
    let slug = t
        .slug_column
        .as_ref()
        .map_or_else(|| "NULL".to_string(), Ident::quoted);
    let mut sql = format!(
        "SELECT {id}::bigint AS id, {slug}::text AS slug, {status}::text AS status, \
         {ns}::text AS namespace FROM {table}",
        id = t.id_column.quoted(),
        status = t.status_column.quoted(),
        ns = t.namespace_column.quoted(),
        table = t.table.sql(),
    );
    match filter {
        TenantFilter::Unmigrated => sql.push_str(&format!(
            " WHERE {} IS DISTINCT FROM '{}'",
            t.status_column.quoted(),
            MigrationStatus::Migrated.as_str()
        )),
        TenantFilter::Ids(_) => sql.push_str(&format!(" WHERE {} = ANY($1)", t.id_column.quoted())),
        TenantFilter::All => {}
    }
    sql.push_str(&format!(" ORDER BY {}", t.id_column.quoted()));
    sql
}
