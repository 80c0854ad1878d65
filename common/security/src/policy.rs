use std::collections::HashSet;
use std::env;

use tracing::warn;

use crate::context::{SecurityContext, UserIdentity};
use crate::error::SecurityError;

/// Privileged operations, named so denials are attributable in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CatalogWrite,
    CardAdmin,
    OrderInspect,
    OrderRefund,
    OrderRedeliver,
    SettingsWrite,
    AnnouncementWrite,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CatalogWrite => "catalog_write",
            Capability::CardAdmin => "card_admin",
            Capability::OrderInspect => "order_inspect",
            Capability::OrderRefund => "order_refund",
            Capability::OrderRedeliver => "order_redeliver",
            Capability::SettingsWrite => "settings_write",
            Capability::AnnouncementWrite => "announcement_write",
        }
    }
}

/// Admin allowlist. Every admin capability resolves against the same list;
/// the capability only differentiates what gets logged on a denial.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    admins: HashSet<String>,
}

impl AdminPolicy {
    /// ADMIN_USERS is a comma-separated list of usernames, matched
    /// case-insensitively. Unset means no admins.
    pub fn from_env() -> Self {
        Self::from_list(&env::var("ADMIN_USERS").unwrap_or_default())
    }

    pub fn from_list(csv: &str) -> Self {
        let admins = csv
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { admins }
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.admins.contains(&username.to_lowercase())
    }

    /// Single admin gate used by every privileged handler.
    pub fn ensure<'a>(
        &self,
        ctx: &'a SecurityContext,
        capability: Capability,
    ) -> Result<&'a UserIdentity, SecurityError> {
        let user = ctx.user.as_ref().ok_or(SecurityError::Unauthenticated)?;
        if self.is_admin(&user.username) {
            return Ok(user);
        }
        warn!(actor = %user.username, capability = capability.as_str(), "capability_check_failed");
        Err(SecurityError::Forbidden { capability: capability.as_str() })
    }
}
