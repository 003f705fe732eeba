//! Device binding checks.
//!
//! The relay only asks one question of the account store: is this device
//! bound to this account? [`DeviceBindings`] is that question; the store
//! behind it is pluggable.

use crate::config::BindingConfig;
use async_trait::async_trait;
use devlink_core::{AccountId, MainDeviceId, SubDeviceId};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

type BindingTable = HashMap<(AccountId, MainDeviceId), HashSet<SubDeviceId>>;

/// Binding store errors.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The store could not answer right now.
    #[error("Binding store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of which devices belong to which account.
#[async_trait]
pub trait DeviceBindings: Send + Sync {
    /// Whether `main` is bound to `account`.
    async fn is_main_device_bound(
        &self,
        account: AccountId,
        main: MainDeviceId,
    ) -> Result<bool, BindingError>;

    /// Whether `sub` is bound to `main`, and `main` to `account`.
    async fn is_sub_device_bound(
        &self,
        account: AccountId,
        main: MainDeviceId,
        sub: SubDeviceId,
    ) -> Result<bool, BindingError>;
}

/// In-memory binding table.
#[derive(Debug, Default)]
pub struct StaticBindings {
    devices: RwLock<BindingTable>,
}

impl StaticBindings {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configuration entries.
    #[must_use]
    pub fn from_config(bindings: &[BindingConfig]) -> Self {
        let table = Self::new();
        for binding in bindings {
            let account = AccountId(binding.account);
            let main = MainDeviceId(binding.main_device);
            table.bind_main(account, main);
            for sub in &binding.sub_devices {
                table.bind_sub(account, main, SubDeviceId(*sub));
            }
        }
        table
    }

    /// Bind a main device to an account.
    pub fn bind_main(&self, account: AccountId, main: MainDeviceId) {
        self.write().entry((account, main)).or_default();
    }

    /// Bind a sub device to a main device, binding the main device if needed.
    pub fn bind_sub(&self, account: AccountId, main: MainDeviceId, sub: SubDeviceId) {
        self.write().entry((account, main)).or_default().insert(sub);
    }

    /// Unbind a main device and all of its sub devices.
    pub fn unbind_main(&self, account: AccountId, main: MainDeviceId) -> bool {
        self.write().remove(&(account, main)).is_some()
    }

    fn write(&self) -> RwLockWriteGuard<'_, BindingTable> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, BindingTable> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceBindings for StaticBindings {
    async fn is_main_device_bound(
        &self,
        account: AccountId,
        main: MainDeviceId,
    ) -> Result<bool, BindingError> {
        Ok(self.read().contains_key(&(account, main)))
    }

    async fn is_sub_device_bound(
        &self,
        account: AccountId,
        main: MainDeviceId,
        sub: SubDeviceId,
    ) -> Result<bool, BindingError> {
        Ok(self
            .read()
            .get(&(account, main))
            .is_some_and(|subs| subs.contains(&sub)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_bindings_from_config() {
        let bindings = StaticBindings::from_config(&[BindingConfig {
            account: 7,
            main_device: 100,
            sub_devices: vec![1],
        }]);

        assert!(bindings
            .is_main_device_bound(AccountId(7), MainDeviceId(100))
            .await
            .unwrap());
        assert!(!bindings
            .is_main_device_bound(AccountId(8), MainDeviceId(100))
            .await
            .unwrap());
        assert!(bindings
            .is_sub_device_bound(AccountId(7), MainDeviceId(100), SubDeviceId(1))
            .await
            .unwrap());
        assert!(!bindings
            .is_sub_device_bound(AccountId(7), MainDeviceId(100), SubDeviceId(2))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sub_binding_requires_account_match() {
        let bindings = StaticBindings::new();
        bindings.bind_sub(AccountId(7), MainDeviceId(100), SubDeviceId(1));

        assert!(!bindings
            .is_sub_device_bound(AccountId(8), MainDeviceId(100), SubDeviceId(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unbind_main_drops_subs() {
        let bindings = StaticBindings::new();
        bindings.bind_sub(AccountId(7), MainDeviceId(100), SubDeviceId(1));
        assert!(bindings.unbind_main(AccountId(7), MainDeviceId(100)));

        assert!(!bindings
            .is_sub_device_bound(AccountId(7), MainDeviceId(100), SubDeviceId(1))
            .await
            .unwrap());
        assert!(!bindings.unbind_main(AccountId(7), MainDeviceId(100)));
    }
}
