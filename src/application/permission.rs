// Control permission gate
use crate::infrastructure::config::OperatorConfig;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Decides whether a user may issue control commands on a site.
///
/// Checked before any command leaves the client.
pub trait PermissionGate: Send + Sync {
    fn has_control_permission(&self, user_id: &str, site_id: &str) -> bool;

    /// Departments a site belongs to, as learned from the gateway.
    fn update_site_departments(&self, _site_id: &str, _departments: &[String]) {}
}

/// Admins may control every site; other operators need a role that names one
/// of the site's departments.
pub struct RoleDepartmentGate {
    operator: OperatorConfig,
    departments: RwLock<HashMap<String, Vec<String>>>,
}

impl RoleDepartmentGate {
    pub fn new(operator: OperatorConfig) -> Self {
        Self {
            operator,
            departments: RwLock::new(HashMap::new()),
        }
    }
}

impl PermissionGate for RoleDepartmentGate {
    fn has_control_permission(&self, user_id: &str, site_id: &str) -> bool {
        if user_id != self.operator.user_id {
            return false;
        }
        if self.operator.is_admin {
            return true;
        }

        let departments = self.departments.read().unwrap_or_else(PoisonError::into_inner);
        match departments.get(site_id) {
            Some(site_departments) => site_departments
                .iter()
                .any(|d| self.operator.roles.iter().any(|role| role == d)),
            None => false,
        }
    }

    fn update_site_departments(&self, site_id: &str, departments: &[String]) {
        tracing::debug!("Site {} departments: {:?}", site_id, departments);
        self.departments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(site_id.to_string(), departments.to_vec());
    }
}
