//! Session manifest parsing.
//!
//! XNAT serves a subject document shaped like
//! `Subject > experiments > experiment > scans > scan`. The schema namespace
//! differs between archive instances, so it is read from the root element and
//! every child lookup is made against that namespace.

use std::collections::{BTreeMap, HashSet};

use roxmltree::{Document, Node};
use serde::Serialize;
use tracing::warn;

use crate::domain::{AcquisitionRecord, ScanQuality, truncate_uid};
use crate::error::DlError;

/// Typed view of one experiment of a session manifest.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub namespace: Option<String>,
    pub experiment_id: Option<String>,
    pub experiment_label: Option<String>,
    pub records: Vec<AcquisitionRecord>,
    /// Labels of the experiment-level resources (e.g. `NORDIC_VOLUMES`).
    pub session_resources: Vec<String>,
}

impl Manifest {
    /// Parses the first experiment of the document.
    pub fn parse(xml: &[u8]) -> Result<Self, DlError> {
        Self::parse_selected(xml, None)
    }

    /// Parses the experiment whose `ID` attribute equals `experiment_id`.
    pub fn parse_experiment(xml: &[u8], experiment_id: &str) -> Result<Self, DlError> {
        Self::parse_selected(xml, Some(experiment_id))
    }

    fn parse_selected(xml: &[u8], experiment_id: Option<&str>) -> Result<Self, DlError> {
        let text = std::str::from_utf8(xml)
            .map_err(|err| DlError::ManifestFormat(format!("manifest is not UTF-8: {err}")))?;
        let doc = Document::parse(text).map_err(|err| DlError::ManifestFormat(err.to_string()))?;
        let root = doc.root_element();
        let ns = root.tag_name().namespace();

        let experiments = child(root, ns, "experiments")
            .ok_or_else(|| missing_path("experiments"))?;
        let experiment = match experiment_id {
            Some(wanted) => children(experiments, ns, "experiment")
                .find(|node| node.attribute("ID") == Some(wanted))
                .ok_or_else(|| {
                    DlError::ManifestFormat(format!("no experiment with ID {wanted} in manifest"))
                })?,
            None => child(experiments, ns, "experiment")
                .ok_or_else(|| missing_path("experiments/experiment"))?,
        };
        let scans =
            child(experiment, ns, "scans").ok_or_else(|| missing_path("experiments/experiment/scans"))?;

        let records = children(scans, ns, "scan")
            .map(|scan| parse_scan(scan, ns))
            .collect::<Result<Vec<_>, DlError>>()?;
        check_unique_ids(&records)?;

        let session_resources = child(experiment, ns, "resources")
            .map(|resources| resource_labels(resources, ns, "resource"))
            .unwrap_or_default();

        Ok(Self {
            namespace: ns.map(str::to_string),
            experiment_id: experiment.attribute("ID").map(str::to_string),
            experiment_label: experiment.attribute("label").map(str::to_string),
            records,
            session_resources,
        })
    }

    pub fn quality_map(&self) -> BTreeMap<String, ScanQuality> {
        self.records
            .iter()
            .map(|record| (record.id.clone(), record.quality))
            .collect()
    }

    pub fn scan_types(&self) -> BTreeMap<String, String> {
        self.records
            .iter()
            .map(|record| (record.id.clone(), record.kind.clone()))
            .collect()
    }

    pub fn scan_ids(&self) -> Vec<String> {
        self.records.iter().map(|record| record.id.clone()).collect()
    }

    pub fn has_session_resource(&self, label: &str) -> bool {
        self.session_resources.iter().any(|value| value == label)
    }
}

/// Parses a manifest into its acquisition records, in document order.
pub fn parse(xml: &[u8]) -> Result<Vec<AcquisitionRecord>, DlError> {
    Manifest::parse(xml).map(|manifest| manifest.records)
}

/// Same parse as [`parse`], projected onto scan id -> quality.
pub fn parse_quality(xml: &[u8]) -> Result<BTreeMap<String, ScanQuality>, DlError> {
    Manifest::parse(xml).map(|manifest| manifest.quality_map())
}

fn parse_scan(scan: Node<'_, '_>, ns: Option<&str>) -> Result<AcquisitionRecord, DlError> {
    let id = scan
        .attribute("ID")
        .ok_or_else(|| DlError::ManifestFormat("scan element without ID attribute".to_string()))?;
    let unique_id = match scan.attribute("UID") {
        Some(uid) => Some(truncate_uid(uid)?),
        None => {
            warn!(scan = id, "scan has no UID; it will not be paired with ancillary files");
            None
        }
    };
    let quality = ScanQuality::from_label(child(scan, ns, "quality").and_then(|node| node.text()));

    Ok(AcquisitionRecord {
        id: id.to_string(),
        unique_id,
        quality,
        kind: scan.attribute("type").unwrap_or_default().to_string(),
        description: child(scan, ns, "series_description")
            .and_then(|node| node.text())
            .map(|text| text.trim().to_string()),
        resources: resource_labels(scan, ns, "file"),
    })
}

fn check_unique_ids(records: &[AcquisitionRecord]) -> Result<(), DlError> {
    let mut seen = HashSet::new();
    for record in records {
        let Some(unique_id) = record.unique_id.as_deref() else {
            continue;
        };
        if !seen.insert(unique_id) {
            return Err(DlError::ManifestFormat(format!(
                "truncated UID {unique_id} is shared by more than one scan"
            )));
        }
    }
    Ok(())
}

fn resource_labels(parent: Node<'_, '_>, ns: Option<&str>, name: &str) -> Vec<String> {
    children(parent, ns, name)
        .filter_map(|node| node.attribute("label"))
        .map(str::to_string)
        .collect()
}

fn missing_path(path: &str) -> DlError {
    DlError::ManifestFormat(format!("manifest has no {path} element"))
}

fn child<'a, 'input>(
    parent: Node<'a, 'input>,
    ns: Option<&str>,
    name: &str,
) -> Option<Node<'a, 'input>> {
    children(parent, ns, name).next()
}

fn children<'a, 'input, 'n>(
    parent: Node<'a, 'input>,
    ns: Option<&'n str>,
    name: &'n str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'n
where
    'a: 'n,
    'input: 'n,
{
    parent.children().filter(move |node| {
        node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == ns
    })
}
