//! Tenant identity
//!
//! A tenant is the (accountID, projectID) pair. It isolates the tag,
//! metric-id, metric-name and date indexes; metric ids themselves are
//! global across tenants.

use crate::encoding::{marshal_u32, unmarshal_u32};
use crate::error::Result;
use std::fmt;

/// Marshaled size of a [`TenantId`] in bytes
pub const TENANT_ID_LEN: usize = 8;

/// The (accountID, projectID) pair isolating index namespaces
///
/// The marshaled form is big-endian account then project, so byte order on
/// the table groups all of an account's rows together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TenantId {
    /// Account identifier
    pub account_id: u32,
    /// Project identifier within the account
    pub project_id: u32,
}

impl TenantId {
    /// Create a tenant id from its parts
    pub fn new(account_id: u32, project_id: u32) -> Self {
        TenantId {
            account_id,
            project_id,
        }
    }

    /// Append the 8-byte marshaled form to `dst`
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_u32(dst, self.account_id);
        marshal_u32(dst, self.project_id);
    }

    /// Decode a tenant id, returning it and the remaining tail
    pub fn unmarshal(src: &[u8]) -> Result<(TenantId, &[u8])> {
        let (account_id, tail) = unmarshal_u32(src)?;
        let (project_id, tail) = unmarshal_u32(tail)?;
        Ok((
            TenantId {
                account_id,
                project_id,
            },
            tail,
        ))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.project_id)
    }
}
