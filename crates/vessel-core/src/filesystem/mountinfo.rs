//! Mount table parsing.

use std::path::{Path, PathBuf};

use vessel_common::error::{Result, VesselError};

/// Decodes the octal escapes (`\040` etc.) the kernel uses for whitespace
/// and backslashes in mount table fields.
#[must_use]
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points listed in `contents` (in `/proc/self/mounts` format).
#[must_use]
pub fn parse_mountpoints(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Mount points at or below `dir`, deepest first.
///
/// Sorting in reverse lexicographic order guarantees a nested mount point is
/// listed before any of its ancestors.
///
/// # Errors
///
/// Returns an error if `mounts_file` cannot be read.
pub fn mountpoints_under(dir: &Path, mounts_file: &Path) -> Result<Vec<PathBuf>> {
    let contents =
        std::fs::read_to_string(mounts_file).map_err(|e| VesselError::io(mounts_file, e))?;
    let mut points: Vec<PathBuf> = parse_mountpoints(&contents)
        .into_iter()
        .filter(|p| p.starts_with(dir))
        .collect();
    points.sort_unstable_by(|a, b| b.cmp(a));
    points.dedup();
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid 0 0
/dev/loop0 /run/containers/abc/rootfs ext4 ro 0 0
tmpfs /run/containers/abc/rootfs/dev tmpfs rw 0 0
/dev/sda1 /run/containers/abc/with\\040space ext4 rw 0 0
tmpfs /run/containers/abcd tmpfs rw 0 0
";

    #[test]
    fn decodes_octal_escapes() {
        assert_eq!(unescape("a\\040b"), "a b");
        assert_eq!(unescape("tab\\011"), "tab\t");
        assert_eq!(unescape("back\\134slash"), "back\\slash");
        assert_eq!(unescape("plain\\x"), "plain\\x");
    }

    #[test]
    fn lists_nested_mounts_deepest_first() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        std::fs::write(tmp.path(), MOUNTS).expect("write");
        let points = mountpoints_under(Path::new("/run/containers/abc"), tmp.path()).expect("read");
        assert_eq!(
            points,
            vec![
                PathBuf::from("/run/containers/abc/with space"),
                PathBuf::from("/run/containers/abc/rootfs/dev"),
                PathBuf::from("/run/containers/abc/rootfs"),
            ]
        );
    }

    #[test]
    fn missing_mounts_file_is_an_error() {
        assert!(mountpoints_under(Path::new("/"), Path::new("/nonexistent/mounts")).is_err());
    }
}
