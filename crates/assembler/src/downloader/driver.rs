//! Driver manifest written once every package of a task is on disk

use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use crate::downloader::core::{files, DownloadError, FileOperation, Result};
use crate::downloader::model::DownloadTask;

pub const DRIVER_FILE_NAME: &str = "driver.xml";
const INSTALL_DIR: &str = "/Applications";

/// Render the driver manifest for a resolved task.
///
/// The first sub-product is the main product; the rest are its dependencies.
pub fn render(task: &DownloadTask) -> Result<String> {
    let main = task.products.first().ok_or_else(|| DownloadError::InvalidData {
        message: format!("task {} has no resolved products", task.id),
    })?;

    let mut xml = String::from("<DriverInfo>\n    <ProductInfo>\n");
    push_element(&mut xml, 8, "Name", &task.display_name);
    push_element(&mut xml, 8, "SAPCode", &main.sap_code);
    push_element(&mut xml, 8, "CodexVersion", &main.version);
    push_element(&mut xml, 8, "Platform", &main.platform);
    push_element(&mut xml, 8, "EsdDirectory", &format!("./{}", main.sap_code));

    let dependencies = &task.products[1..];
    if !dependencies.is_empty() {
        xml.push_str("        <Dependencies>\n");
        for dependency in dependencies {
            xml.push_str("            <Dependency>\n");
            push_element(&mut xml, 16, "SAPCode", &dependency.sap_code);
            push_element(&mut xml, 16, "BaseVersion", &dependency.base_version);
            push_element(&mut xml, 16, "BuildVersion", &dependency.version);
            push_element(&mut xml, 16, "Platform", &dependency.platform);
            push_element(&mut xml, 16, "EsdDirectory", &format!("./{}", dependency.sap_code));
            xml.push_str("            </Dependency>\n");
        }
        xml.push_str("        </Dependencies>\n");
    }

    xml.push_str("    </ProductInfo>\n    <RequestInfo>\n");
    push_element(&mut xml, 8, "InstallDir", INSTALL_DIR);
    push_element(&mut xml, 8, "InstallLanguage", &task.language);
    xml.push_str("    </RequestInfo>\n</DriverInfo>\n");
    Ok(xml)
}

/// Write `driver.xml` into the task's products directory
pub async fn write(task: &DownloadTask) -> Result<PathBuf> {
    let dir = task.products_dir();
    files::ensure_dir(&dir).await?;
    let path = dir.join(DRIVER_FILE_NAME);
    let xml = render(task)?;
    fs::write(&path, xml)
        .await
        .map_err(|e| DownloadError::io(&path, FileOperation::Write, e))?;
    debug!("Wrote driver manifest {}", path.display());
    Ok(path)
}

fn push_element(xml: &mut String, indent: usize, name: &str, value: &str) {
    let _ = writeln!(xml, "{:indent$}<{name}>{}</{name}>", "", escape(value), indent = indent, name = name);
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
