//! Request routing.
//!
//! Resolves a request to an execution plan: an explicit server alias wins,
//! then an explicit group, then the configured default backend. Role
//! permissions gate every resolved target. Group selection reuses the
//! executor's score-based discipline at execution time; the router only
//! fixes the candidate set and mode.

use std::sync::Arc;

use sqlgate_db::{BackendServer, ServerRegistry};
use sqlgate_error::{Result, SqlGateError};

use crate::exec::{DistributedMode, ExecutionPlan};
use crate::inspect::QueryInfo;
use crate::request::QueryRequest;

/// Chooses a backend or group for each request.
pub struct Router {
    registry:       Arc<ServerRegistry>,
    default_server: Option<String>,
}

impl Router {
    /// Router over a registry with an optional default backend.
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>, default_server: Option<String>) -> Self {
        Self {
            registry,
            default_server,
        }
    }

    /// Resolve a request to an execution plan.
    ///
    /// # Errors
    ///
    /// Returns routing errors for unknown/inactive targets and for roles
    /// not permitted on the resolved backend(s).
    pub fn route(&self, req: &QueryRequest, info: &QueryInfo) -> Result<ExecutionPlan> {
        if let Some(alias) = &req.server_alias {
            return self.local_plan(alias, &req.principal.role);
        }

        if let Some(group) = &req.server_group {
            return self.group_plan(group, &req.principal.role, info);
        }

        match &self.default_server {
            Some(alias) => self.local_plan(alias, &req.principal.role),
            None => Err(SqlGateError::routing(
                "request names neither a server nor a group, and no default backend is configured",
            )),
        }
    }

    fn local_plan(&self, alias: &str, role: &str) -> Result<ExecutionPlan> {
        let server = self
            .registry
            .get(alias)
            .ok_or_else(|| SqlGateError::routing(format!("unknown server alias '{alias}'")))?;
        if !server.is_active {
            return Err(SqlGateError::routing(format!("server '{alias}' is not active")));
        }
        if !server.allows_role(role) {
            return Err(SqlGateError::routing(format!(
                "role '{role}' is not permitted on server '{alias}'"
            )));
        }
        Ok(ExecutionPlan::Local { server })
    }

    fn group_plan(&self, group: &str, role: &str, info: &QueryInfo) -> Result<ExecutionPlan> {
        let members = self.registry.active_members(group);
        if members.is_empty() {
            return Err(SqlGateError::routing(format!(
                "no active servers in group '{group}'"
            )));
        }

        let permitted: Vec<Arc<BackendServer>> = members
            .into_iter()
            .filter(|s| s.allows_role(role))
            .collect();
        if permitted.is_empty() {
            return Err(SqlGateError::routing(format!(
                "role '{role}' is not permitted on any server in group '{group}'"
            )));
        }

        Ok(ExecutionPlan::Distributed {
            group:   group.to_string(),
            servers: permitted,
            mode:    DistributedMode::for_query(info.query_type),
        })
    }
}
