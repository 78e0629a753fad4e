//! Base image versions and base disk migration.
//!
//! Base images carry a version token in their file name, e.g.
//! `nodevm-alpine-0.1.2.rd5-x86_64.qcow2`: a semantic version followed by
//! an `rdN` build counter that breaks ties between equal semvers.

use nodevm_core::error::{Result, VmError};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageVersion {
    pub semver: semver::Version,
    pub build: u64,
}

impl ImageVersion {
    /// Parse `X.Y.Z.rdN`.
    pub fn parse(token: &str) -> Option<Self> {
        let (semver, build) = token.split_once(".rd")?;
        Some(Self {
            semver: semver::Version::parse(semver).ok()?,
            build: build.parse().ok()?,
        })
    }

    /// Find the version token in an image path or file name.
    pub fn from_image_name(location: &str) -> Option<Self> {
        let name = location.rsplit(['/', '\\']).next()?;
        name.split(['-', '_']).find_map(|segment| {
            Self::parse(segment).or_else(|| {
                // The last segment still carries the extension.
                segment
                    .split_once(".rd")
                    .and_then(|(semver, rest)| {
                        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                        Self::parse(&format!("{}.rd{}", semver, digits))
                    })
            })
        })
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.rd{}", self.semver, self.build)
    }
}

/// The bundled image: the first `.qcow2`/`.img` in `dir` with a version token.
pub fn find_bundled_image(dir: &Path) -> Result<(PathBuf, ImageVersion)> {
    let found = crate::paths::find_in_dir(dir, |name| {
        (name.ends_with(".qcow2") || name.ends_with(".img"))
            && ImageVersion::from_image_name(name).is_some()
    })?;

    found
        .and_then(|path| {
            let version = ImageVersion::from_image_name(&path.to_string_lossy())?;
            Some((path, version))
        })
        .ok_or_else(|| {
            VmError::fatal_with_hint(
                format!("No bundled base image found in {}", dir.display()),
                "Reinstall nodevm",
            )
        })
}

/// What a comparison of bundled and on-disk versions requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    /// No existing instance or nothing to compare against
    Fresh,
    UpToDate,
    Upgrade { from: ImageVersion, to: ImageVersion },
}

/// Decide what to do with the on-disk base image.
///
/// A bundled image older than the one on disk is fatal: the user data was
/// written by a newer release and cannot be downgraded.
pub fn plan(bundled: &ImageVersion, on_disk: Option<&str>) -> Result<MigrationPlan> {
    let Some(location) = on_disk else {
        return Ok(MigrationPlan::Fresh);
    };
    let Some(current) = ImageVersion::from_image_name(location) else {
        tracing::warn!(image = %location, "Base image has no version token, treating as fresh");
        return Ok(MigrationPlan::Fresh);
    };

    compare(bundled, &current)
}

/// Plan for a known on-disk version.
pub fn compare(bundled: &ImageVersion, current: &ImageVersion) -> Result<MigrationPlan> {
    match bundled.cmp(current) {
        Ordering::Less => Err(VmError::fatal_with_hint(
            format!(
                "The VM was created by a newer release (base image {}, this release ships {})",
                current, bundled
            ),
            "Upgrade nodevm to the latest version, or reset the VM",
        )),
        Ordering::Equal => Ok(MigrationPlan::UpToDate),
        Ordering::Greater => Ok(MigrationPlan::Upgrade {
            from: current.clone(),
            to: bundled.clone(),
        }),
    }
}

/// Copy the new base image over `basedisk`, leaving `diffdisk` alone.
pub async fn replace_basedisk(bundled_image: &Path, basedisk: &Path) -> Result<()> {
    if !basedisk.exists() {
        tracing::debug!(basedisk = %basedisk.display(), "No base disk yet, nothing to replace");
        return Ok(());
    }

    let staged = basedisk.with_extension("migrating");
    tokio::fs::copy(bundled_image, &staged).await.map_err(|e| {
        VmError::fatal(format!(
            "Failed to copy base image {}: {}",
            bundled_image.display(),
            e
        ))
    })?;
    tokio::fs::rename(&staged, basedisk).await?;
    tracing::info!(basedisk = %basedisk.display(), "Base disk replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(token: &str) -> ImageVersion {
        ImageVersion::parse(token).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let version = v("0.1.2.rd5");
        assert_eq!(version.semver, semver::Version::new(0, 1, 2));
        assert_eq!(version.build, 5);
        assert_eq!(version.to_string(), "0.1.2.rd5");
        assert!(ImageVersion::parse("0.1.2").is_none());
        assert!(ImageVersion::parse("0.1.rd2").is_none());
    }

    #[test]
    fn test_ordering_uses_build_as_tiebreaker() {
        assert!(v("0.1.2.rd3") < v("0.1.2.rd5"));
        assert!(v("0.1.2.rd10") > v("0.1.2.rd9"));
        assert!(v("0.2.0.rd1") > v("0.1.9.rd99"));
        assert!(v("1.0.0.rd1") > v("1.0.0-beta.1.rd7"));
    }

    #[test]
    fn test_from_image_name() {
        assert_eq!(
            ImageVersion::from_image_name("/opt/res/images/nodevm-alpine-0.1.2.rd5-x86_64.qcow2"),
            Some(v("0.1.2.rd5"))
        );
        assert_eq!(
            ImageVersion::from_image_name("nodevm-0.3.1.rd12.qcow2"),
            Some(v("0.3.1.rd12"))
        );
        assert_eq!(ImageVersion::from_image_name("alpine-lima-std.iso"), None);
    }

    #[test]
    fn test_plan() {
        let bundled = v("0.1.2.rd5");
        assert_eq!(plan(&bundled, None).unwrap(), MigrationPlan::Fresh);
        assert_eq!(
            plan(&bundled, Some("/x/nodevm-0.1.2.rd5-aarch64.qcow2")).unwrap(),
            MigrationPlan::UpToDate
        );
        assert_eq!(
            plan(&bundled, Some("/x/nodevm-0.1.2.rd3-aarch64.qcow2")).unwrap(),
            MigrationPlan::Upgrade {
                from: v("0.1.2.rd3"),
                to: v("0.1.2.rd5"),
            }
        );

        let older = v("0.1.2.rd2");
        let err = plan(&older, Some("/x/nodevm-0.1.2.rd5-aarch64.qcow2")).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_find_bundled_image() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();
        std::fs::write(dir.path().join("nodevm-0.1.2.rd5-x86_64.qcow2"), "img").unwrap();

        let (path, version) = find_bundled_image(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("nodevm-0.1.2.rd5-x86_64.qcow2"));
        assert_eq!(version, v("0.1.2.rd5"));

        let empty = TempDir::new().unwrap();
        assert!(find_bundled_image(empty.path()).unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_replace_basedisk_keeps_diffdisk() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("new.qcow2");
        let basedisk = dir.path().join("basedisk");
        let diffdisk = dir.path().join("diffdisk");
        std::fs::write(&image, "new base").unwrap();
        std::fs::write(&basedisk, "old base").unwrap();
        std::fs::write(&diffdisk, "user data").unwrap();

        replace_basedisk(&image, &basedisk).await.unwrap();
        assert_eq!(std::fs::read_to_string(&basedisk).unwrap(), "new base");
        assert_eq!(std::fs::read_to_string(&diffdisk).unwrap(), "user data");
        assert!(!dir.path().join("basedisk.migrating").exists());
    }
}
