//! dm-verity targets for integrity-checked read-only mounts.
//!
//! Parameters use the `key=value` form
//! `payload=ROOT_DEV hashtree=HASH_DEV hashstart=<sectors> alg=<name>
//! root_hexdigest=<hex> [salt=<hex>]`, where `ROOT_DEV` and `HASH_DEV`
//! stand for the (possibly loop-backed) source device. The target is
//! created and removed with `dmsetup`.

use std::path::{Path, PathBuf};
use std::process::Command;

use vessel_common::error::{Result, VesselError};

/// Placeholder replaced by the source device path.
const ROOT_DEV: &str = "ROOT_DEV";
/// Placeholder replaced by the source device path.
const HASH_DEV: &str = "HASH_DEV";

/// Sectors per verity block.
const SECTORS_PER_BLOCK: u64 = 8;

/// Parsed verity parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityParams {
    /// Data device.
    pub payload: String,
    /// Hash tree device.
    pub hashtree: String,
    /// Offset of the hash tree in 512-byte sectors; also the data size.
    pub hashstart: u64,
    /// Hash algorithm.
    pub alg: String,
    /// Expected root hash, hex encoded.
    pub root_hexdigest: String,
    /// Optional salt, hex encoded.
    pub salt: Option<String>,
}

impl VerityParams {
    /// Parses `params`, substituting the device placeholders with `source`.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] for unknown keys, a malformed
    /// `hashstart`, or a missing required key.
    pub fn parse(params: &str, source: &Path) -> Result<Self> {
        let source = source.display().to_string();
        let dev = |v: &str| match v {
            ROOT_DEV | HASH_DEV => source.clone(),
            other => other.to_owned(),
        };

        let (mut payload, mut hashtree, mut hashstart, mut alg, mut digest, mut salt) =
            (None, None, None, None, None, None);
        for token in params.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                return Err(VesselError::config(format!("verity option '{token}' lacks '='")));
            };
            match key {
                "payload" => payload = Some(dev(value)),
                "hashtree" => hashtree = Some(dev(value)),
                "hashstart" => {
                    hashstart = Some(value.parse::<u64>().map_err(|e| {
                        VesselError::config(format!("verity hashstart '{value}': {e}"))
                    })?);
                }
                "alg" => alg = Some(value.to_owned()),
                "root_hexdigest" => digest = Some(value.to_owned()),
                "salt" => salt = Some(value.to_owned()),
                other => {
                    return Err(VesselError::config(format!("unknown verity option '{other}'")));
                }
            }
        }

        let missing = |k: &str| VesselError::config(format!("verity option '{k}' is required"));
        Ok(Self {
            payload: payload.ok_or_else(|| missing("payload"))?,
            hashtree: hashtree.ok_or_else(|| missing("hashtree"))?,
            hashstart: hashstart.ok_or_else(|| missing("hashstart"))?,
            alg: alg.ok_or_else(|| missing("alg"))?,
            root_hexdigest: digest.ok_or_else(|| missing("root_hexdigest"))?,
            salt,
        })
    }

    /// Device-mapper table line for the `verity` target.
    #[must_use]
    pub fn table(&self) -> String {
        let blocks = self.hashstart / SECTORS_PER_BLOCK;
        format!(
            "0 {} verity 1 {} {} 4096 4096 {blocks} {blocks} {} {} {}",
            self.hashstart,
            self.payload,
            self.hashtree,
            self.alg,
            self.root_hexdigest,
            self.salt.as_deref().unwrap_or("-"),
        )
    }
}

/// A created verity target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityDevice {
    /// Device-mapper name, used for removal.
    pub name: String,
    /// Block device to mount.
    pub path: PathBuf,
}

fn dmsetup(args: &[&str]) -> Result<()> {
    let bin = which::which("dmsetup").map_err(|e| VesselError::NotFound {
        kind: "executable",
        id: format!("dmsetup ({e})"),
    })?;
    let output = Command::new(&bin)
        .args(args)
        .output()
        .map_err(|e| VesselError::io(&bin, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(VesselError::io(
            bin,
            std::io::Error::other(format!(
                "dmsetup {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        ))
    }
}

/// Creates a read-only verity target over `source`.
///
/// # Errors
///
/// Returns an error if the parameters are invalid, `dmsetup` is missing, or
/// the target cannot be created.
pub fn setup(source: &Path, params: &str) -> Result<VerityDevice> {
    let params = VerityParams::parse(params, source)?;
    let name = format!("vessel-{}", uuid::Uuid::new_v4().simple());
    let table = params.table();
    dmsetup(&["create", &name, "--readonly", "--table", &table])?;
    tracing::debug!(name = %name, source = %source.display(), "verity target created");
    Ok(VerityDevice {
        path: PathBuf::from("/dev/mapper").join(&name),
        name,
    })
}

/// Removes the device-mapper target `name`.
///
/// # Errors
///
/// Returns an error if `dmsetup` is missing or the removal fails.
pub fn teardown(name: &str) -> Result<()> {
    dmsetup(&["remove", name])?;
    tracing::debug!(name, "verity target removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: &str = "payload=ROOT_DEV hashtree=HASH_DEV hashstart=2048 alg=sha256 \
                          root_hexdigest=abcd salt=0011";

    #[test]
    fn substitutes_source_device() {
        let p = VerityParams::parse(PARAMS, Path::new("/dev/loop3")).expect("parse");
        assert_eq!(p.payload, "/dev/loop3");
        assert_eq!(p.hashtree, "/dev/loop3");
        assert_eq!(p.hashstart, 2048);
    }

    #[test]
    fn builds_verity_table() {
        let p = VerityParams::parse(PARAMS, Path::new("/dev/loop3")).expect("parse");
        assert_eq!(
            p.table(),
            "0 2048 verity 1 /dev/loop3 /dev/loop3 4096 4096 256 256 sha256 abcd 0011"
        );
    }

    #[test]
    fn missing_salt_renders_dash() {
        let p = VerityParams::parse(
            "payload=/dev/a hashtree=/dev/b hashstart=8 alg=sha1 root_hexdigest=ff",
            Path::new("/dev/loop0"),
        )
        .expect("parse");
        assert!(p.table().ends_with("sha1 ff -"));
    }

    #[test]
    fn rejects_bad_options() {
        let src = Path::new("/dev/loop0");
        assert!(VerityParams::parse("payload=ROOT_DEV", src).is_err());
        assert!(VerityParams::parse("bogus=1", src).is_err());
        assert!(VerityParams::parse("hashstart=x", src).is_err());
        assert!(VerityParams::parse("payload", src).is_err());
    }
}
