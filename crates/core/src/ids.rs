//! Platform identifiers
//!
//! User ids and uids follow the platform encoding: a uid is
//! `user_id * PER_USER_RANGE + app_id`.

use std::fmt;
use serde::{Deserialize, Serialize};

/// Kernel uid of a package
pub type Uid = u32;

/// Number of uids reserved per user
pub const PER_USER_RANGE: u32 = 100_000;

/// First app id handed out to applications; everything below is a system uid
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Android user (profile) id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i32);

impl UserId {
    /// The system user
    pub const SYSTEM: UserId = UserId(0);
    /// Sentinel meaning "all users"; never a valid key component
    pub const ALL: UserId = UserId(-1);
    /// Sentinel meaning "no user"; never a valid key component
    pub const NULL: UserId = UserId(-10_000);

    /// Whether this id names a concrete user
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// User owning the given uid
    pub fn of_uid(uid: Uid) -> Self {
        UserId((uid / PER_USER_RANGE) as i32)
    }

    /// Compose a uid for an app id in this user
    pub fn uid_for(self, app_id: u32) -> Uid {
        (self.0.max(0) as u32) * PER_USER_RANGE + app_id % PER_USER_RANGE
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// App id part of a uid
pub fn app_id(uid: Uid) -> u32 {
    uid % PER_USER_RANGE
}

/// Whether the uid belongs to the platform rather than an installed app
pub fn is_system_uid(uid: Uid) -> bool {
    app_id(uid) < FIRST_APPLICATION_UID
}
