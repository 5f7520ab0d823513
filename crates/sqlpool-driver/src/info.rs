//! Driver capability descriptors.
//!
//! A [`DriverInfo`] carries the handful of vendor-specific facts the pools
//! need: how to ping a connection, how to switch schema, and how to read back
//! the key generated by the last insert. Identifier quoting and case folding
//! ride along for the benefit of SQL-generating layers above the pool.

/// Policy used to retrieve the id generated by the last insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LastInsertPolicy {
    /// The driver cannot report generated ids.
    #[default]
    None,
    /// Read the statement's generated-keys result set.
    GeneratedKeys,
    /// Execute this follow-up query on the same connection.
    Query(String),
    /// Invoke a driver-specific method, resolved by name through
    /// [`DataSource::last_insert_method`](crate::DataSource::last_insert_method).
    Method(String),
    /// An `INSERT ... RETURNING` clause. Not supported by the pool.
    Returning,
}

impl LastInsertPolicy {
    /// Whether update statements must be prepared with generated keys enabled.
    #[must_use]
    pub fn wants_generated_keys(&self) -> bool {
        matches!(self, Self::GeneratedKeys)
    }
}

/// How the database folds unquoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseFolding {
    /// Identifiers are case-sensitive.
    Sensitive,
    /// Unquoted identifiers fold to upper case.
    Uppercase,
    /// Unquoted identifiers fold to lower case.
    Lowercase,
    /// Folding behavior is not known.
    #[default]
    Unknown,
}

impl CaseFolding {
    /// Apply the folding rule to an identifier.
    #[must_use]
    pub fn fold(&self, identifier: &str) -> String {
        match self {
            Self::Uppercase => identifier.to_uppercase(),
            Self::Lowercase => identifier.to_lowercase(),
            Self::Sensitive | Self::Unknown => identifier.to_string(),
        }
    }
}

/// Placeholder replaced by the schema name in [`DriverInfo::schema_query`].
pub const SCHEMA_PLACEHOLDER: &str = "$schema";

/// Vendor-specific facts about a database driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriverInfo {
    /// Vendor tag, e.g. `"postgresql"`.
    pub vendor: String,
    /// Cheap query used to verify a connection is alive.
    pub ping_query: Option<String>,
    /// Statement template switching the current schema; contains `$schema`.
    pub schema_query: Option<String>,
    /// How to read back generated ids.
    pub last_insert: LastInsertPolicy,
    /// Identifier quote character.
    pub identifier_quote: Option<char>,
    /// Identifier case folding rule.
    pub case_folding: CaseFolding,
}

impl DriverInfo {
    /// Create a descriptor for a vendor with no capabilities set.
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            ..Self::default()
        }
    }

    /// Set the ping query.
    #[must_use]
    pub fn ping_query(mut self, query: impl Into<String>) -> Self {
        self.ping_query = Some(query.into());
        self
    }

    /// Set the schema-set template.
    #[must_use]
    pub fn schema_query(mut self, template: impl Into<String>) -> Self {
        self.schema_query = Some(template.into());
        self
    }

    /// Set the last-insert-id policy.
    #[must_use]
    pub fn last_insert(mut self, policy: LastInsertPolicy) -> Self {
        self.last_insert = policy;
        self
    }

    /// Set the identifier quote character.
    #[must_use]
    pub fn identifier_quote(mut self, quote: char) -> Self {
        self.identifier_quote = Some(quote);
        self
    }

    /// Set the case folding rule.
    #[must_use]
    pub fn case_folding(mut self, folding: CaseFolding) -> Self {
        self.case_folding = folding;
        self
    }

    /// Render the schema-set statement for `schema`, if the driver has one.
    #[must_use]
    pub fn schema_query_for(&self, schema: &str) -> Option<String> {
        self.schema_query
            .as_deref()
            .map(|template| template.replace(SCHEMA_PLACEHOLDER, schema))
    }

    /// Quote an identifier with the driver's quote character.
    #[must_use]
    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self.identifier_quote {
            Some(q) => {
                let escaped = identifier.replace(q, &format!("{q}{q}"));
                format!("{q}{escaped}{q}")
            }
            None => identifier.to_string(),
        }
    }

    /// Built-in descriptor for a known vendor tag (case-insensitive).
    #[must_use]
    pub fn for_vendor(vendor: &str) -> Option<Self> {
        let info = match vendor.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Self::new("mysql")
                .ping_query("select 1")
                .schema_query("use $schema")
                .last_insert(LastInsertPolicy::Method("getLastInsertID".into()))
                .identifier_quote('`')
                .case_folding(CaseFolding::Sensitive),
            "postgresql" | "postgres" => Self::new("postgresql")
                .ping_query("select 1")
                .schema_query("set search_path = $schema")
                .last_insert(LastInsertPolicy::Query("select lastval()".into()))
                .identifier_quote('"')
                .case_folding(CaseFolding::Lowercase),
            "oracle" => Self::new("oracle")
                .ping_query("select 1 from dual")
                .schema_query("alter session set current_schema = $schema")
                .last_insert(LastInsertPolicy::Returning)
                .identifier_quote('"')
                .case_folding(CaseFolding::Uppercase),
            "sqlserver" | "mssql" => Self::new("sqlserver")
                .ping_query("select 1")
                .last_insert(LastInsertPolicy::GeneratedKeys)
                .identifier_quote('"')
                .case_folding(CaseFolding::Sensitive),
            "sqlite" => Self::new("sqlite")
                .ping_query("select 1")
                .last_insert(LastInsertPolicy::Query("select last_insert_rowid()".into()))
                .identifier_quote('"')
                .case_folding(CaseFolding::Sensitive),
            "hsqldb" => Self::new("hsqldb")
                .ping_query("call 1")
                .schema_query("set schema $schema")
                .last_insert(LastInsertPolicy::Query("call identity()".into()))
                .identifier_quote('"')
                .case_folding(CaseFolding::Uppercase),
            "derby" => Self::new("derby")
                .ping_query("values 1")
                .schema_query("set schema $schema")
                .last_insert(LastInsertPolicy::GeneratedKeys)
                .identifier_quote('"')
                .case_folding(CaseFolding::Uppercase),
            _ => return None,
        };
        Some(info)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_query_substitution() {
        let info = DriverInfo::for_vendor("postgresql").unwrap();
        assert_eq!(
            info.schema_query_for("sales").as_deref(),
            Some("set search_path = sales")
        );
        assert!(DriverInfo::default().schema_query_for("sales").is_none());
    }

    #[test]
    fn test_vendor_lookup_is_case_insensitive() {
        assert_eq!(DriverInfo::for_vendor("MySQL").unwrap().vendor, "mysql");
        assert_eq!(DriverInfo::for_vendor("mssql").unwrap().vendor, "sqlserver");
        assert!(DriverInfo::for_vendor("dbase").is_none());
    }

    #[test]
    fn test_generated_keys_requirement() {
        assert!(LastInsertPolicy::GeneratedKeys.wants_generated_keys());
        assert!(!LastInsertPolicy::Query("select 1".into()).wants_generated_keys());
        assert!(!LastInsertPolicy::None.wants_generated_keys());
    }

    #[test]
    fn test_quote_identifier_escapes_quote_char() {
        let info = DriverInfo::new("x").identifier_quote('"');
        assert_eq!(info.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(DriverInfo::default().quote_identifier("plain"), "plain");
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(CaseFolding::Uppercase.fold("Users"), "USERS");
        assert_eq!(CaseFolding::Lowercase.fold("Users"), "users");
        assert_eq!(CaseFolding::Sensitive.fold("Users"), "Users");
    }
}
