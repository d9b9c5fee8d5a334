//! Device access control via the v1 `devices` controller.
//!
//! Rules are written to `devices.allow`/`devices.deny` in the kernel's
//! `"<type> <major>:<minor> <access>"` syntax. [`DevicePolicy`] mirrors every
//! rule applied to a cgroup so the effective policy can be queried without
//! reading kernel state back.

use std::fmt;

use vessel_common::error::{Result, VesselError};

/// Device class a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Block devices (`b`).
    Block,
    /// Character devices (`c`).
    Char,
    /// Every device (`a`).
    All,
}

impl DeviceType {
    /// Parses the single-letter form used in configs.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] for anything but `b`, `c`, `a`.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'b' => Ok(Self::Block),
            'c' => Ok(Self::Char),
            'a' => Ok(Self::All),
            other => Err(VesselError::config(format!("unknown device type '{other}'"))),
        }
    }

    /// Single-letter form.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Block => 'b',
            Self::Char => 'c',
            Self::All => 'a',
        }
    }

    const fn covers(self, other: Self) -> bool {
        matches!(self, Self::All) || self as u8 == other as u8
    }
}

/// Access bits of a device rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceAccess {
    /// Read.
    pub read: bool,
    /// Write.
    pub write: bool,
    /// `mknod`.
    pub modify: bool,
}

impl DeviceAccess {
    /// Read, write and mknod.
    pub const ALL: Self = Self {
        read: true,
        write: true,
        modify: true,
    };

    /// Read only.
    pub const READ: Self = Self {
        read: true,
        write: false,
        modify: false,
    };

    /// Returns `true` when no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.read && !self.write && !self.modify
    }

    const fn contains(self, other: Self) -> bool {
        (self.read || !other.read) && (self.write || !other.write) && (self.modify || !other.modify)
    }
}

impl fmt::Display for DeviceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.modify {
            f.write_str("m")?;
        }
        Ok(())
    }
}

/// A single allow or deny rule. `None` for major/minor means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRule {
    /// Whether the rule grants (`true`) or revokes access.
    pub allow: bool,
    /// Device class.
    pub kind: DeviceType,
    /// Major number, or every major.
    pub major: Option<u32>,
    /// Minor number, or every minor.
    pub minor: Option<u32>,
    /// Access bits the rule covers.
    pub access: DeviceAccess,
}

impl DeviceRule {
    /// Builds a rule from config-style numbers where `-1` means "all".
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] for negative numbers other
    /// than `-1`.
    pub fn from_raw(
        allow: bool,
        kind: DeviceType,
        major: i32,
        minor: i32,
        access: DeviceAccess,
    ) -> Result<Self> {
        let convert = |n: i32, what: &str| -> Result<Option<u32>> {
            match n {
                -1 => Ok(None),
                n => u32::try_from(n)
                    .map(Some)
                    .map_err(|_| VesselError::config(format!("invalid device {what} {n}"))),
            }
        };
        Ok(Self {
            allow,
            kind,
            major: convert(major, "major")?,
            minor: convert(minor, "minor")?,
            access,
        })
    }

    /// Line written to `devices.allow` or `devices.deny`.
    #[must_use]
    pub fn to_cgroup_line(&self) -> String {
        let num = |n: Option<u32>| n.map_or_else(|| "*".to_owned(), |n| n.to_string());
        format!(
            "{} {}:{} {}",
            self.kind.as_char(),
            num(self.major),
            num(self.minor),
            self.access
        )
    }

    /// Control file the rule is written to.
    #[must_use]
    pub const fn control_file(&self) -> &'static str {
        if self.allow {
            "devices.allow"
        } else {
            "devices.deny"
        }
    }

    fn matches(&self, kind: DeviceType, major: u32, minor: u32) -> bool {
        self.kind.covers(kind)
            && self.major.is_none_or(|m| m == major)
            && self.minor.is_none_or(|m| m == minor)
    }
}

/// In-memory mirror of the rules applied to a `devices` cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePolicy {
    rules: Vec<DeviceRule>,
}

impl DevicePolicy {
    /// Resets to a policy denying every device.
    pub fn deny_all(&mut self) {
        self.rules.clear();
    }

    /// Records a rule applied after all previous ones.
    pub fn apply(&mut self, rule: DeviceRule) {
        self.rules.push(rule);
    }

    /// Rules in application order.
    #[must_use]
    pub fn rules(&self) -> &[DeviceRule] {
        &self.rules
    }

    /// Whether `access` to the given device is permitted.
    ///
    /// Each requested bit is decided by the last rule that matches the
    /// device and covers the bit; bits no rule covers are denied.
    #[must_use]
    pub fn permits(&self, kind: DeviceType, major: u32, minor: u32, access: DeviceAccess) -> bool {
        let bit = |want: DeviceAccess| {
            self.rules
                .iter()
                .rev()
                .find(|r| r.matches(kind, major, minor) && r.access.contains(want))
                .is_some_and(|r| r.allow)
        };
        (!access.read || bit(DeviceAccess::READ))
            && (!access.write
                || bit(DeviceAccess {
                    write: true,
                    ..DeviceAccess::default()
                }))
            && (!access.modify
                || bit(DeviceAccess {
                    modify: true,
                    ..DeviceAccess::default()
                }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kernel_rule_syntax() {
        let rule = DeviceRule::from_raw(true, DeviceType::Block, 7, -1, DeviceAccess::READ)
            .expect("rule");
        assert_eq!(rule.to_cgroup_line(), "b 7:* r");
        assert_eq!(rule.control_file(), "devices.allow");

        let all = DeviceRule::from_raw(false, DeviceType::All, -1, -1, DeviceAccess::ALL)
            .expect("rule");
        assert_eq!(all.to_cgroup_line(), "a *:* rwm");
        assert_eq!(all.control_file(), "devices.deny");
    }

    #[test]
    fn rejects_negative_numbers_other_than_wildcard() {
        assert!(DeviceRule::from_raw(true, DeviceType::Char, -2, 0, DeviceAccess::ALL).is_err());
    }

    #[test]
    fn empty_policy_denies_everything() {
        let policy = DevicePolicy::default();
        assert!(!policy.permits(DeviceType::Char, 1, 3, DeviceAccess::READ));
    }

    #[test]
    fn last_matching_rule_wins() {
        let mut policy = DevicePolicy::default();
        policy.deny_all();
        policy.apply(
            DeviceRule::from_raw(true, DeviceType::Block, -1, -1, DeviceAccess::ALL).expect("rule"),
        );
        policy.apply(
            DeviceRule::from_raw(false, DeviceType::Block, 1, 5, DeviceAccess::ALL).expect("rule"),
        );

        assert!(!policy.permits(DeviceType::Block, 1, 5, DeviceAccess::READ));
        assert!(policy.permits(DeviceType::Block, 1, 6, DeviceAccess::ALL));
        assert!(policy.permits(DeviceType::Block, 8, 5, DeviceAccess::READ));
        assert!(!policy.permits(DeviceType::Char, 1, 6, DeviceAccess::READ));
    }

    #[test]
    fn partial_access_rules_are_per_bit() {
        let mut policy = DevicePolicy::default();
        policy.apply(
            DeviceRule::from_raw(true, DeviceType::Char, 10, 200, DeviceAccess::READ)
                .expect("rule"),
        );
        assert!(policy.permits(DeviceType::Char, 10, 200, DeviceAccess::READ));
        assert!(!policy.permits(DeviceType::Char, 10, 200, DeviceAccess::ALL));
    }
}
