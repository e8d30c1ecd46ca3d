//! Per-build manifest parsing into package lists

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::downloader::core::{DownloadError, Result};
use crate::downloader::model::{Package, PackageType};

/// Language value that selects every language-specific package
pub const ALL_LANGUAGES: &str = "ALL";

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "Packages")]
    packages: PackageList,
}

#[derive(Debug, Deserialize)]
struct PackageList {
    #[serde(rename = "Package")]
    package: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    #[serde(rename = "Type", default)]
    package_type: Option<String>,
    #[serde(rename = "FullPackageName", alias = "fullPackageName", default)]
    full_package_name: Option<String>,
    #[serde(rename = "DownloadSize", default)]
    download_size: Option<Value>,
    #[serde(rename = "Path", default)]
    path: Option<String>,
    #[serde(rename = "Condition", default)]
    condition: Option<String>,
}

/// Parse a manifest document into the packages to download for `language`.
///
/// Entries without a name, a path or a positive size are dropped. Fails with
/// `InvalidData` when the document has no package list at all.
pub fn parse_manifest(text: &str, language: &str) -> Result<Vec<Package>> {
    let document: ManifestDocument = serde_json::from_str(text).map_err(|e| DownloadError::InvalidData {
        message: format!("manifest has no package list: {}", e),
    })?;

    let packages = document
        .packages
        .package
        .into_iter()
        .filter_map(|entry| {
            let raw: RawPackage = serde_json::from_value(entry).ok()?;
            to_package(raw, language)
        })
        .collect();
    Ok(packages)
}

fn to_package(raw: RawPackage, language: &str) -> Option<Package> {
    let name = raw.full_package_name.filter(|n| !n.trim().is_empty())?;
    let Some(path) = raw.path.filter(|p| !p.trim().is_empty()) else {
        debug!("Dropping package {} without a download path", name);
        return None;
    };
    let Some(size) = raw.download_size.as_ref().and_then(parse_size) else {
        debug!("Dropping package {} without a usable size", name);
        return None;
    };

    let package_type = raw
        .package_type
        .as_deref()
        .map_or(PackageType::NonCore, PackageType::from_manifest);
    if package_type == PackageType::NonCore && !language_matches(raw.condition.as_deref(), language) {
        debug!("Skipping package {} for another language", name);
        return None;
    }

    Some(Package::new(package_type, name, size, path))
}

/// Sizes arrive as numbers or numeric strings; only positive values are usable
fn parse_size(value: &Value) -> Option<u64> {
    let size = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (size > 0).then_some(size)
}

fn language_matches(condition: Option<&str>, language: &str) -> bool {
    match condition {
        Some(condition) if condition.contains("installLanguage") => {
            language == ALL_LANGUAGES || condition.contains(language)
        }
        _ => true,
    }
}
