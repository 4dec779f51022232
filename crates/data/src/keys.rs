//! Cache keys
//!
//! Structural keys: two keys built from equal parts hash and compare equal,
//! so they reach the same cached node.

use std::fmt;

use permctl_core::{Uid, UserId};
use serde::Serialize;

/// Keys naming one package of one user
pub trait PackageScoped {
    fn package(&self) -> &str;
    fn user(&self) -> UserId;

    fn is_for(&self, package: &str, user: UserId) -> bool {
        self.package() == package && self.user() == user
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PackageKey {
    pub package: String,
    pub user: UserId,
}

impl PackageKey {
    pub fn new(package: impl Into<String>, user: UserId) -> Self {
        Self {
            package: package.into(),
            user,
        }
    }
}

impl PackageScoped for PackageKey {
    fn package(&self) -> &str {
        &self.package
    }

    fn user(&self) -> UserId {
        self.user
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.user)
    }
}

/// One permission group of one package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AppPermGroupKey {
    pub package: String,
    pub group: String,
    pub user: UserId,
}

impl AppPermGroupKey {
    pub fn new(package: impl Into<String>, group: impl Into<String>, user: UserId) -> Self {
        Self {
            package: package.into(),
            group: group.into(),
            user,
        }
    }

    pub fn package_key(&self) -> PackageKey {
        PackageKey::new(self.package.clone(), self.user)
    }

    pub fn group_key(&self) -> PermGroupKey {
        PermGroupKey(self.group.clone())
    }
}

impl PackageScoped for AppPermGroupKey {
    fn package(&self) -> &str {
        &self.package
    }

    fn user(&self) -> UserId {
        self.user
    }
}

impl fmt::Display for AppPermGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.package, self.group, self.user)
    }
}

/// A permission group by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PermGroupKey(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UidKey {
    pub uid: Uid,
    pub user: UserId,
}

impl UidKey {
    pub fn of(uid: Uid) -> Self {
        Self {
            uid,
            user: UserId::of_uid(uid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UserKey(pub UserId);

/// A set of app-ops watched together. Order does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OpUsageKey {
    pub ops: Vec<String>,
}

impl OpUsageKey {
    pub fn new<I, S>(ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ops: Vec<String> = ops.into_iter().map(Into::into).collect();
        ops.sort();
        ops.dedup();
        Self { ops }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_equality() {
        let a = AppPermGroupKey::new("com.example", "android.permission-group.CAMERA", UserId::SYSTEM);
        let b = AppPermGroupKey::new(
            String::from("com.example"),
            String::from("android.permission-group.CAMERA"),
            UserId(0),
        );
        let keys: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(keys.len(), 1);
        assert!(a.is_for("com.example", UserId::SYSTEM));
        assert!(!a.is_for("com.example", UserId(10)));
        assert_eq!(a.package_key(), PackageKey::new("com.example", UserId::SYSTEM));
    }

    #[test]
    fn test_op_usage_key_ignores_order() {
        assert_eq!(
            OpUsageKey::new(["android:camera", "android:record_audio", "android:camera"]),
            OpUsageKey::new(["android:record_audio", "android:camera"])
        );
    }

    #[test]
    fn test_uid_key_user() {
        assert_eq!(UidKey::of(1_010_001).user, UserId(10));
    }
}
