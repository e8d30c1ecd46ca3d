//! Product catalog and build resolution
//!
//! The remote catalog document is parsed elsewhere; this module only holds the
//! resulting records and picks the build to download for a product and each of
//! its dependencies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{DownloadError, FileOperation, Result};

/// A dependency declared by a product version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub code: String,
    /// Base version the dependency is declared against
    pub version: String,
}

/// One build of a product for one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVersion {
    pub version: String,
    pub base_version: String,
    pub build_guid: String,
    pub platform: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub code: String,
    pub display_name: String,
    #[serde(default)]
    pub versions: Vec<ProductVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayName {
    pub code: String,
    pub display_name: String,
}

/// Products keyed by code, restricted to the allowed platforms
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Prefix joined with package paths to form download URLs
    pub cdn: String,
    pub products: HashMap<String, Product>,
    pub display_names: Vec<DisplayName>,
}

/// On-disk catalog layout read by [`JsonCatalog`]
#[derive(Debug, Deserialize)]
struct CatalogFile {
    cdn: String,
    products: Vec<Product>,
}

impl Catalog {
    /// Build a catalog, dropping versions for platforms outside `allowed_platforms`
    pub fn new(cdn: impl Into<String>, products: Vec<Product>, allowed_platforms: &[String]) -> Self {
        let mut display_names = Vec::with_capacity(products.len());
        let products = products
            .into_iter()
            .map(|mut product| {
                product
                    .versions
                    .retain(|v| allowed_platforms.iter().any(|p| p == &v.platform));
                display_names.push(DisplayName {
                    code: product.code.clone(),
                    display_name: product.display_name.clone(),
                });
                (product.code.clone(), product)
            })
            .collect();
        display_names.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        Self {
            cdn: cdn.into().trim_end_matches('/').to_string(),
            products,
            display_names,
        }
    }

    pub fn product(&self, code: &str) -> Option<&Product> {
        self.products.get(code)
    }

    /// Full download URL of a server-relative package path
    pub fn package_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.cdn, path)
        } else {
            format!("{}/{}", self.cdn, path)
        }
    }

    /// Build of the requested product version, preferring the earliest allowed platform
    pub fn resolve_main(&self, code: &str, version: &str, config: &DownloadConfig) -> Result<ProductVersion> {
        let product = self.product(code).ok_or_else(|| DownloadError::InvalidData {
            message: format!("product {} is not in the catalog", code),
        })?;

        product
            .versions
            .iter()
            .filter(|v| v.version == version)
            .filter_map(|v| config.platform_rank(&v.platform).map(|rank| (rank, v)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| DownloadError::InvalidData {
                message: format!("no build of {} {} for an allowed platform", code, version),
            })
    }

    /// Build of a dependency declared against `base_version`.
    ///
    /// Among builds on an allowed platform whose base version matches, the
    /// highest version wins; equal versions fall back to platform preference.
    /// `None` when the dependency has no such build.
    pub fn resolve_dependency(&self, dependency: &Dependency, config: &DownloadConfig) -> Option<ProductVersion> {
        let product = self.product(&dependency.code)?;
        let best = product
            .versions
            .iter()
            .filter(|v| v.base_version == dependency.version)
            .filter_map(|v| config.platform_rank(&v.platform).map(|rank| (rank, v)))
            .max_by(|(rank_a, a), (rank_b, b)| {
                compare_versions(&a.version, &b.version).then_with(|| rank_b.cmp(rank_a))
            })
            .map(|(_, v)| v.clone());

        if let Some(build) = &best {
            debug!(
                "Resolved dependency {} {} to {} ({})",
                dependency.code, dependency.version, build.version, build.platform
            );
        }
        best
    }
}

/// Compare dotted version strings component by component as numbers
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(['.', '-'])
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Where the catalog comes from
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Catalog>;
}

/// Catalog stored as JSON on the local filesystem
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
    allowed_platforms: Vec<String>,
}

impl JsonCatalog {
    pub fn new<P: AsRef<Path>>(path: P, config: &DownloadConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            allowed_platforms: config.allowed_platforms.clone(),
        }
    }

    pub fn parse(&self, text: &str) -> Result<Catalog> {
        let file: CatalogFile = serde_json::from_str(text).map_err(|e| DownloadError::InvalidData {
            message: format!("catalog {} is not valid: {}", self.path.display(), e),
        })?;
        Ok(Catalog::new(file.cdn, file.products, &self.allowed_platforms))
    }
}

#[async_trait]
impl CatalogSource for JsonCatalog {
    async fn fetch_catalog(&self) -> Result<Catalog> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DownloadError::io(&self.path, FileOperation::Read, e))?;
        let catalog = self.parse(&text)?;
        debug!("Loaded catalog with {} products", catalog.products.len());
        Ok(catalog)
    }
}
