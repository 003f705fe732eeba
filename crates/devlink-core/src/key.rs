//! Device and channel identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! device_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

device_id!(
    /// Account (user) that devices are bound to.
    AccountId
);
device_id!(
    /// Publisher device of a room.
    MainDeviceId
);
device_id!(
    /// Subscriber device, unique within a room.
    SubDeviceId
);

/// Identifies a room: the account and the main device that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Owning account.
    pub account: AccountId,
    /// Publishing main device.
    pub main_device: MainDeviceId,
}

impl ChannelKey {
    /// Create a new channel key.
    #[must_use]
    pub fn new(account: impl Into<AccountId>, main_device: impl Into<MainDeviceId>) -> Self {
        Self {
            account: account.into(),
            main_device: main_device.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.account, self.main_device)
    }
}
