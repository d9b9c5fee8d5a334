//! User namespace id mapping.
//!
//! Maps container UIDs/GIDs to host UIDs/GIDs. A map is written as
//! comma-separated `inside outside count` triples, e.g. `0 100000 1024`.

use std::fmt;
use std::str::FromStr;

use vessel_common::error::{Result, VesselError};

/// One contiguous range of a UID or GID map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    /// First id inside the namespace.
    pub inside: u32,
    /// First id on the host the range maps to.
    pub outside: u32,
    /// Length of the range.
    pub count: u32,
}

impl IdMapEntry {
    fn translate(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.inside)?;
        if offset < self.count {
            self.outside.checked_add(offset)
        } else {
            None
        }
    }
}

/// A UID or GID map. The empty map is the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    entries: Vec<IdMapEntry>,
}

impl IdMap {
    /// Parses a map string.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if a triple is malformed or
    /// has a zero count.
    pub fn parse(map: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for chunk in map.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let fields: Vec<&str> = chunk.split_whitespace().collect();
            let [inside, outside, count] = fields.as_slice() else {
                return Err(VesselError::config(format!(
                    "id map entry '{chunk}' must have 3 fields"
                )));
            };
            let parse = |s: &str| {
                s.parse::<u32>().map_err(|e| {
                    VesselError::config(format!("id map entry '{chunk}': {e}"))
                })
            };
            let entry = IdMapEntry {
                inside: parse(inside)?,
                outside: parse(outside)?,
                count: parse(count)?,
            };
            if entry.count == 0 {
                return Err(VesselError::config(format!(
                    "id map entry '{chunk}' has an empty range"
                )));
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Map that sends container id 0 to a single host id.
    #[must_use]
    pub fn single(host_id: u32) -> Self {
        Self {
            entries: vec![IdMapEntry {
                inside: 0,
                outside: host_id,
                count: 1,
            }],
        }
    }

    /// Returns `true` if no ranges are configured.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the configured ranges.
    #[must_use]
    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }

    /// Translates an id inside the namespace to the host id it maps to.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the id is not covered by
    /// any range.
    pub fn outside_id(&self, inside: u32) -> Result<u32> {
        if self.is_identity() {
            return Ok(inside);
        }
        self.entries
            .iter()
            .find_map(|e| e.translate(inside))
            .ok_or_else(|| VesselError::config(format!("id {inside} is not mapped by '{self}'")))
    }

    /// Renders the map in the format expected by `/proc/<pid>/uid_map`.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{} {} {}\n", e.inside, e.outside, e.count))
            .collect()
    }
}

impl FromStr for IdMap {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{} {} {}", e.inside, e.outside, e.count)?;
        }
        Ok(())
    }
}

/// Writes the UID/GID maps of a freshly cloned child.
///
/// When `deny_setgroups` is set, `setgroups` is disabled first, which the
/// kernel requires before an unprivileged process may write a GID map.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/setgroups`,
/// `/proc/<pid>/uid_map`, or `/proc/<pid>/gid_map` fails.
#[cfg(target_os = "linux")]
pub fn write_id_maps(pid: i32, uid_map: &IdMap, gid_map: &IdMap, deny_setgroups: bool) -> Result<()> {
    let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));

    if deny_setgroups {
        let setgroups_path = proc_dir.join("setgroups");
        if setgroups_path.exists() {
            std::fs::write(&setgroups_path, "deny")
                .map_err(|e| VesselError::io(setgroups_path, e))?;
        }
    }

    if !uid_map.is_identity() {
        let uid_map_path = proc_dir.join("uid_map");
        std::fs::write(&uid_map_path, uid_map.to_proc_format())
            .map_err(|e| VesselError::io(uid_map_path, e))?;
    }

    if !gid_map.is_identity() {
        let gid_map_path = proc_dir.join("gid_map");
        std::fs::write(&gid_map_path, gid_map.to_proc_format())
            .map_err(|e| VesselError::io(gid_map_path, e))?;
    }

    tracing::debug!(pid, uid_map = %uid_map, gid_map = %gid_map, "wrote id maps");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; id mapping requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn write_id_maps(_pid: i32, _uid_map: &IdMap, _gid_map: &IdMap, _deny_setgroups: bool) -> Result<()> {
    Err(VesselError::JailFailed {
        message: "Linux required for user namespaces".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_is_identity() {
        let map = IdMap::parse("").expect("parse");
        assert!(map.is_identity());
        assert_eq!(map.outside_id(1234).expect("identity"), 1234);
    }

    #[test]
    fn translates_within_range() {
        let map = IdMap::parse("0 100000 1024").expect("parse");
        assert_eq!(map.outside_id(0).expect("mapped"), 100_000);
        assert_eq!(map.outside_id(1023).expect("mapped"), 101_023);
    }

    #[test]
    fn rejects_unmapped_id() {
        let map = IdMap::parse("0 100000 10").expect("parse");
        assert!(map.outside_id(10).is_err());
    }

    #[test]
    fn uses_first_matching_range() {
        let map = IdMap::parse("0 1000 1,1 100000 999").expect("parse");
        assert_eq!(map.outside_id(0).expect("mapped"), 1000);
        assert_eq!(map.outside_id(5).expect("mapped"), 100_004);
    }

    #[test]
    fn rejects_malformed_maps() {
        assert!(IdMap::parse("0 1000").is_err());
        assert!(IdMap::parse("0 a 1").is_err());
        assert!(IdMap::parse("0 1000 0").is_err());
        assert!(IdMap::parse("-1 0 1").is_err());
    }

    #[test]
    fn renders_proc_format_one_line_per_range() {
        let map = IdMap::parse("0 1000 1, 1 100000 999").expect("parse");
        assert_eq!(map.to_proc_format(), "0 1000 1\n1 100000 999\n");
        assert_eq!(map.to_string(), "0 1000 1,1 100000 999");
    }

    #[test]
    fn single_maps_root_to_host_id() {
        let map = IdMap::single(1000);
        assert_eq!(map.to_string(), "0 1000 1");
        assert_eq!(map.outside_id(0).expect("mapped"), 1000);
    }
}
