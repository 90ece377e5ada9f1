//! SQL identifiers.
//!
//! Every schema, table and column name that reaches SQL text goes through
//! [`Ident`], which only accepts names matching an allow-list. Quoting is
//! then purely cosmetic: nothing that needs escaping can get in.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::tenant::Tenant;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Prefix of every tenant schema.
pub const NAMESPACE_PREFIX: &str = "tenant_";

/// A validated SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    /// PostgreSQL truncates identifiers beyond this many bytes (NAMEDATALEN - 1).
    pub const MAX_LEN: usize = 63;

    /// Validate a raw name against the allow-list.
    pub fn new(value: impl Into<String>) -> Result<Self, MigrationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(MigrationError::InvalidIdentifier {
                value,
                reason: "empty",
            });
        }
        if value.len() > Self::MAX_LEN {
            return Err(MigrationError::InvalidIdentifier {
                value,
                reason: "longer than 63 bytes",
            });
        }
        if !IDENT_RE.is_match(&value) {
            return Err(MigrationError::InvalidIdentifier {
                value,
                reason: "only ASCII letters, digits and underscores are allowed",
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

impl PartialEq<str> for Ident {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Ident {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Schema name owned by one tenant: `tenant_<slug or id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NamespaceName(Ident);

impl NamespaceName {
    /// Derive the schema name for a tenant.
    ///
    /// Uses the slug when present (and not blank), otherwise the numeric id.
    /// The result is lower-cased and every character outside `[a-z0-9]`
    /// becomes `_`, so the same tenant always yields the same name.
    pub fn for_tenant(tenant: &Tenant) -> Result<Self, MigrationError> {
        let basis = match tenant.slug.as_deref().map(str::trim) {
            Some(slug) if !slug.is_empty() => slug.to_string(),
            _ => tenant.id.to_string(),
        };
        let sanitized: String = basis
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        Ident::new(format!("{NAMESPACE_PREFIX}{sanitized}")).map(Self)
    }

    /// Accept a name recorded earlier (e.g. in the tenant directory).
    pub fn parse(value: &str) -> Result<Self, MigrationError> {
        if !value.starts_with(NAMESPACE_PREFIX) {
            return Err(MigrationError::InvalidIdentifier {
                value: value.to_string(),
                reason: "tenant schemas must start with tenant_",
            });
        }
        Ident::new(value).map(Self)
    }

    /// Resolve the schema of a tenant: the recorded one, else the derived one.
    pub fn resolve(tenant: &Tenant) -> Result<Self, MigrationError> {
        match tenant.namespace.as_deref() {
            Some(recorded) if !recorded.is_empty() => Self::parse(recorded),
            _ => Self::for_tenant(tenant),
        }
    }

    pub fn ident(&self) -> &Ident {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `schema.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTable {
    pub schema: Ident,
    pub table: Ident,
}

impl QualifiedTable {
    pub fn new(schema: &Ident, table: &Ident) -> Self {
        Self {
            schema: schema.clone(),
            table: table.clone(),
        }
    }

    /// Quoted form for SQL text: `"schema"."table"`.
    pub fn sql(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.table.quoted())
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

fn default_discriminator() -> String {
    "tenant_id".to_string()
}

#[derive(Deserialize)]
struct RawTableSpec {
    name: String,
    #[serde(default = "default_discriminator")]
    discriminator: String,
}

/// A table that takes part in migration and rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTableSpec")]
pub struct TableSpec {
    pub table: Ident,
    pub discriminator: Ident,
}

impl TableSpec {
    pub fn new(table: &str, discriminator: &str) -> Result<Self, MigrationError> {
        Ok(Self {
            table: Ident::new(table)?,
            discriminator: Ident::new(discriminator)?,
        })
    }

    /// Table discriminated by the conventional `tenant_id` column.
    pub fn tenant_scoped(table: &str) -> Result<Self, MigrationError> {
        Self::new(table, &default_discriminator())
    }
}

impl TryFrom<RawTableSpec> for TableSpec {
    type Error = MigrationError;

    fn try_from(raw: RawTableSpec) -> Result<Self, Self::Error> {
        Self::new(&raw.name, &raw.discriminator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{MigrationStatus, TenantId};

    fn tenant(id: i64, slug: Option<&str>) -> Tenant {
        Tenant {
            id: TenantId(id),
            slug: slug.map(str::to_string),
            status: MigrationStatus::Unmigrated,
            namespace: None,
        }
    }

    #[test]
    fn test_namespace_from_slug() {
        let ns = NamespaceName::for_tenant(&tenant(42, Some("acme-corp"))).unwrap();
        assert_eq!(ns.as_str(), "tenant_acme_corp");
    }

    #[test]
    fn test_namespace_is_idempotent() {
        let t = tenant(7, Some("Big Co. (EU)"));
        let first = NamespaceName::for_tenant(&t).unwrap();
        let second = NamespaceName::for_tenant(&t).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "tenant_big_co___eu_");
    }

    #[test]
    fn test_namespace_falls_back_to_id() {
        assert_eq!(
            NamespaceName::for_tenant(&tenant(42, None)).unwrap().as_str(),
            "tenant_42"
        );
        assert_eq!(
            NamespaceName::for_tenant(&tenant(42, Some("   "))).unwrap().as_str(),
            "tenant_42"
        );
    }

    #[test]
    fn test_namespace_non_ascii_is_replaced() {
        let ns = NamespaceName::for_tenant(&tenant(3, Some("café"))).unwrap();
        assert_eq!(ns.as_str(), "tenant_caf_");
    }

    #[test]
    fn test_namespace_too_long() {
        let slug = "a".repeat(60);
        let err = NamespaceName::for_tenant(&tenant(1, Some(&slug))).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_resolve_prefers_recorded_name() {
        let mut t = tenant(42, Some("acme-corp"));
        t.namespace = Some("tenant_acme_legacy".into());
        assert_eq!(
            NamespaceName::resolve(&t).unwrap().as_str(),
            "tenant_acme_legacy"
        );
    }

    #[test]
    fn test_parse_rejects_foreign_schema() {
        assert!(NamespaceName::parse("public").is_err());
        assert!(NamespaceName::parse("tenant_x\"; DROP").is_err());
    }

    #[test]
    fn test_ident_rejects_injection() {
        assert!(Ident::new("students").is_ok());
        assert!(Ident::new("Students_2").is_ok());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("1abc").is_err());
        assert!(Ident::new("a\"b").is_err());
        assert!(Ident::new("a b").is_err());
        assert!(Ident::new("x; drop table y").is_err());
    }

    #[test]
    fn test_qualified_table_sql() {
        let t = QualifiedTable::new(
            &Ident::new("tenant_acme").unwrap(),
            &Ident::new("students").unwrap(),
        );
        assert_eq!(t.sql(), "\"tenant_acme\".\"students\"");
        assert_eq!(t.to_string(), "tenant_acme.students");
    }

    #[test]
    fn test_table_spec_from_toml_defaults_discriminator() {
        let spec: TableSpec = toml::from_str("name = \"courses\"").unwrap();
        assert_eq!(spec.table, "courses");
        assert_eq!(spec.discriminator, "tenant_id");
        assert!(toml::from_str::<TableSpec>("name = \"bad-name\"").is_err());
    }
}
