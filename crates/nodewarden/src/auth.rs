// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App token issuance for node containers.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// App name the big-sibling container authenticates as.
pub const INTERNAL_APP_NAME: &str = "big-sibling";

/// Issues and revokes app tokens.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Issue a token for `app`.
    async fn login_app(&self, app: &str) -> Result<String>;

    /// Revoke a token.
    async fn logout(&self, token: &str) -> Result<()>;
}

/// In-process token issuer. Tokens are random and only valid in this
/// process.
#[derive(Debug, Default)]
pub struct LocalAuth {
    active: Mutex<BTreeSet<String>>,
}

impl LocalAuth {
    /// Issuer with no tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens issued and not revoked.
    pub fn active_tokens(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuthService for LocalAuth {
    async fn login_app(&self, app: &str) -> Result<String> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone());
        debug!(app = %app, "App token issued");
        Ok(token)
    }

    async fn logout(&self, token: &str) -> Result<()> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        Ok(())
    }
}
