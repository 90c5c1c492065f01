//! Snapshot document parsing.
//!
//! Snapshots are XML documents of the form
//!
//! ```xml
//! <InstrumentStatus>
//!   <PackageID>8f2c</PackageID>
//!   <DeviceStatus>
//!     <ModuleCategoryID>SAMPLER</ModuleCategoryID>
//!     <IndexWithinRole>0</IndexWithinRole>
//!     <RapidControlStatus>&lt;CombinedSamplerStatus&gt;...</RapidControlStatus>
//!   </DeviceStatus>
//! </InstrumentStatus>
//! ```
//!
//! `RapidControlStatus` carries an escaped XML fragment; it is kept verbatim
//! on the entry and interpreted later by enrichment.

use std::path::Path;

use serde::Deserialize;

use super::{ModuleEntry, ParseError, StatusRecord};

#[derive(Debug, Deserialize)]
struct SnapshotDocument {
    #[serde(rename = "PackageID", default)]
    package_id: Option<String>,
    #[serde(rename = "DeviceStatus", default)]
    devices: Vec<DeviceDocument>,
}

#[derive(Debug, Deserialize)]
struct DeviceDocument {
    #[serde(rename = "ModuleCategoryID")]
    module_category_id: String,
    #[serde(rename = "IndexWithinRole", default)]
    index_within_role: i32,
    #[serde(rename = "RapidControlStatus", default)]
    rapid_control_status: Option<String>,
}

impl From<DeviceDocument> for ModuleEntry {
    fn from(device: DeviceDocument) -> Self {
        Self {
            module_id: device.module_category_id,
            index_within_role: device.index_within_role,
            state: Default::default(),
            status_fragment: device.rapid_control_status.filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Parse a snapshot document from a string.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] when the XML is not well formed or a
/// device lacks its `ModuleCategoryID`.
pub fn parse_snapshot_str(xml: &str) -> Result<StatusRecord, ParseError> {
    let document: SnapshotDocument =
        quick_xml::de::from_str(xml).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let package_id = document
        .package_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    Ok(StatusRecord::new(
        package_id,
        document.devices.into_iter().map(ModuleEntry::from).collect(),
    ))
}

/// Read and parse a snapshot file.
///
/// # Errors
///
/// Returns [`ParseError::Read`] if the file cannot be read or is not UTF-8,
/// otherwise the errors of [`parse_snapshot_str`].
pub fn parse_snapshot_file(path: &Path) -> Result<StatusRecord, ParseError> {
    let xml = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_snapshot_str(&xml)
}
