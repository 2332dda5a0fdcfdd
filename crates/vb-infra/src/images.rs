//! OS catalogue shared by both drivers.
//!
//! Requests name an OS by distro plus either a numeric version or a release
//! codename. The modern runtime wants the version, the classic download
//! template is happiest with the codename where one exists.

pub const DEFAULT_DISTRO: &str = "ubuntu";
pub const DEFAULT_VERSION: &str = "22.04";

struct Release {
    version: &'static str,
    codename: Option<&'static str>,
}

/// Known distros. The first release listed is the distro's default.
const CATALOGUE: &[(&str, &[Release])] = &[
    (
        "ubuntu",
        &[
            Release { version: "22.04", codename: Some("jammy") },
            Release { version: "24.04", codename: Some("noble") },
            Release { version: "20.04", codename: Some("focal") },
        ],
    ),
    (
        "debian",
        &[
            Release { version: "12", codename: Some("bookworm") },
            Release { version: "11", codename: Some("bullseye") },
        ],
    ),
    ("centos", &[Release { version: "9-Stream", codename: None }]),
    ("alpine", &[Release { version: "3.18", codename: None }]),
    ("fedora", &[Release { version: "38", codename: None }]),
];

/// A catalogue lookup result, independent of either runtime's naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub distro: String,
    pub version: String,
    pub codename: Option<String>,
}

impl OsRelease {
    /// Release string for download-style fetching: codename when known.
    pub fn release_name(&self) -> &str {
        self.codename.as_deref().unwrap_or(&self.version)
    }
}

/// Resolve a requested OS. Never fails: an unknown distro falls back to
/// ubuntu 22.04 with a warning, an unknown version of a known distro is
/// passed through as given.
pub fn resolve(os: &str, version: Option<&str>) -> OsRelease {
    let distro = os.trim().to_ascii_lowercase();
    let version = version.map(str::trim).filter(|v| !v.is_empty());

    let Some((name, releases)) = CATALOGUE.iter().find(|(name, _)| *name == distro) else {
        tracing::warn!(
            requested_os = os,
            requested_version = version.unwrap_or(""),
            fallback = %format!("{DEFAULT_DISTRO} {DEFAULT_VERSION}"),
            "unknown OS, using default image"
        );
        return resolve(DEFAULT_DISTRO, Some(DEFAULT_VERSION));
    };

    let release = match version {
        None => releases.first(),
        Some(v) => releases.iter().find(|r| {
            r.version.eq_ignore_ascii_case(v)
                || r.codename.is_some_and(|c| c.eq_ignore_ascii_case(v))
        }),
    };

    match release {
        Some(r) => OsRelease {
            distro: name.to_string(),
            version: r.version.to_string(),
            codename: r.codename.map(str::to_string),
        },
        None => {
            let v = version.unwrap_or_default();
            tracing::debug!(distro = name, version = v, "version not in catalogue, passing through");
            OsRelease {
                distro: name.to_string(),
                version: v.to_string(),
                codename: None,
            }
        }
    }
}
