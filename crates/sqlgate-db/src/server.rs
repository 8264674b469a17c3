//! Backend server and group registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlgate_error::{Result, SqlGateError};

/// Database types supported behind the proxy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL database (primary, full feature set).
    Postgres,
    /// MySQL database.
    Mysql,
    /// SQLite database (local dev, testing).
    Sqlite,
    /// SQL Server database.
    SqlServer,
}

impl DatabaseType {
    /// Get database type as string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend database server behind the proxy, identified by alias.
///
/// The alias is stable once referenced by cache keys or audit rows; servers
/// are never hard-deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    /// Unique, stable alias.
    pub alias: String,

    /// Hostname or address.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Connect username.
    pub username: String,

    /// Connect password.
    pub password: String,

    /// Backend database type.
    pub db_type: DatabaseType,

    /// Connection pool upper bound. Must be at least 1.
    pub max_connections: u32,

    /// Load-balancing weight. Must be positive; higher wins score ties.
    pub weight: f64,

    /// Roles permitted to target this server. Empty means all roles.
    #[serde(default)]
    pub allowed_roles: HashSet<String>,

    /// Whether the server accepts new traffic.
    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Server group membership, if any.
    #[serde(default)]
    pub group: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl BackendServer {
    /// Validate the invariants this registry enforces.
    pub fn validate(&self) -> Result<()> {
        if self.alias.is_empty() {
            return Err(SqlGateError::validation("server alias cannot be empty"));
        }
        if self.max_connections < 1 {
            return Err(SqlGateError::validation(format!(
                "server '{}': max_connections must be at least 1",
                self.alias
            )));
        }
        if self.weight <= 0.0 {
            return Err(SqlGateError::validation(format!(
                "server '{}': weight must be positive",
                self.alias
            )));
        }
        Ok(())
    }

    /// Check whether a role may target this server.
    ///
    /// An empty `allowed_roles` set admits every role.
    #[must_use]
    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(role)
    }
}

/// A named set of equivalent backends over which reads are balanced and
/// writes replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroup {
    /// Group name.
    pub name: String,

    /// Aliases of member servers.
    pub members: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    servers: HashMap<String, Arc<BackendServer>>,
    groups:  HashMap<String, ServerGroup>,
}

/// Registry of backend servers and server groups.
///
/// Mutations swap the stored `Arc<BackendServer>` so readers holding a
/// reference observe a consistent snapshot.
#[derive(Default)]
pub struct ServerRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend server.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the server invariants fail or the
    /// alias is already registered.
    pub fn register(&self, server: BackendServer) -> Result<()> {
        server.validate()?;

        let mut inner = self.inner.write();
        if inner.servers.contains_key(&server.alias) {
            return Err(SqlGateError::validation(format!(
                "server alias '{}' is already registered",
                server.alias
            )));
        }
        if let Some(group) = &server.group {
            let entry = inner
                .groups
                .entry(group.clone())
                .or_insert_with(|| ServerGroup {
                    name:    group.clone(),
                    members: Vec::new(),
                });
            entry.members.push(server.alias.clone());
        }
        tracing::info!(alias = %server.alias, db_type = %server.db_type, "backend server registered");
        inner.servers.insert(server.alias.clone(), Arc::new(server));
        Ok(())
    }

    /// Look up a server by alias.
    #[must_use]
    pub fn get(&self, alias: &str) -> Option<Arc<BackendServer>> {
        self.inner.read().servers.get(alias).cloned()
    }

    /// Look up a group by name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<ServerGroup> {
        self.inner.read().groups.get(name).cloned()
    }

    /// Active members of a group, in stable registration order.
    #[must_use]
    pub fn active_members(&self, group: &str) -> Vec<Arc<BackendServer>> {
        let inner = self.inner.read();
        let Some(group) = inner.groups.get(group) else {
            return Vec::new();
        };
        group
            .members
            .iter()
            .filter_map(|alias| inner.servers.get(alias))
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    /// All registered aliases.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        self.inner.read().servers.keys().cloned().collect()
    }

    /// Logically delete a server. The alias stays registered so audit rows
    /// and cache keys keep resolving; the server just stops taking traffic.
    pub fn deactivate(&self, alias: &str) -> Result<()> {
        self.update(alias, |s| s.is_active = false)
    }

    /// Reactivate a previously deactivated server.
    pub fn activate(&self, alias: &str) -> Result<()> {
        self.update(alias, |s| s.is_active = true)
    }

    /// Adjust the load-balancing weight (autoscaler action).
    pub fn set_weight(&self, alias: &str, weight: f64) -> Result<()> {
        if weight <= 0.0 {
            return Err(SqlGateError::validation("weight must be positive"));
        }
        self.update(alias, |s| s.weight = weight)
    }

    /// Record a new pool bound (autoscaler action). The live pool is resized
    /// separately by [`crate::PoolManager`]; this keeps the registry's view
    /// consistent for newly created pools.
    pub fn set_max_connections(&self, alias: &str, max_connections: u32) -> Result<()> {
        if max_connections < 1 {
            return Err(SqlGateError::validation("max_connections must be at least 1"));
        }
        self.update(alias, |s| s.max_connections = max_connections)
    }

    fn update(&self, alias: &str, f: impl FnOnce(&mut BackendServer)) -> Result<()> {
        let mut inner = self.inner.write();
        let server = inner
            .servers
            .get_mut(alias)
            .ok_or_else(|| SqlGateError::routing(format!("unknown server alias '{alias}'")))?;
        let mut updated = (**server).clone();
        f(&mut updated);
        *server = Arc::new(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(alias: &str, group: Option<&str>) -> BackendServer {
        BackendServer {
            alias:           alias.to_string(),
            host:            "localhost".to_string(),
            port:            5432,
            database:        "app".to_string(),
            username:        "gate".to_string(),
            password:        "secret".to_string(),
            db_type:         DatabaseType::Postgres,
            max_connections: 5,
            weight:          1.0,
            allowed_roles:   HashSet::new(),
            is_active:       true,
            group:           group.map(String::from),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServerRegistry::new();
        registry.register(server("a", None)).unwrap();

        let found = registry.get("a").unwrap();
        assert_eq!(found.alias, "a");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let registry = ServerRegistry::new();
        registry.register(server("a", None)).unwrap();
        assert!(registry.register(server("a", None)).is_err());
    }

    #[test]
    fn test_invalid_servers_rejected() {
        let registry = ServerRegistry::new();

        let mut zero_conns = server("z", None);
        zero_conns.max_connections = 0;
        assert!(registry.register(zero_conns).is_err());

        let mut bad_weight = server("w", None);
        bad_weight.weight = 0.0;
        assert!(registry.register(bad_weight).is_err());
    }

    #[test]
    fn test_group_membership_and_active_members() {
        let registry = ServerRegistry::new();
        registry.register(server("a", Some("g"))).unwrap();
        registry.register(server("b", Some("g"))).unwrap();
        registry.register(server("c", None)).unwrap();

        let members = registry.active_members("g");
        assert_eq!(members.len(), 2);

        registry.deactivate("b").unwrap();
        let members = registry.active_members("g");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].alias, "a");
    }

    #[test]
    fn test_deactivate_keeps_alias_resolvable() {
        let registry = ServerRegistry::new();
        registry.register(server("a", None)).unwrap();
        registry.deactivate("a").unwrap();

        let found = registry.get("a").unwrap();
        assert!(!found.is_active);
    }

    #[test]
    fn test_role_gate() {
        let mut s = server("a", None);
        assert!(s.allows_role("analyst"));

        s.allowed_roles.insert("admin".to_string());
        assert!(s.allows_role("admin"));
        assert!(!s.allows_role("analyst"));
    }

    #[test]
    fn test_weight_update() {
        let registry = ServerRegistry::new();
        registry.register(server("a", None)).unwrap();

        registry.set_weight("a", 2.5).unwrap();
        assert!((registry.get("a").unwrap().weight - 2.5).abs() < f64::EPSILON);
        assert!(registry.set_weight("a", 0.0).is_err());
        assert!(registry.set_weight("missing", 1.0).is_err());
    }
}
