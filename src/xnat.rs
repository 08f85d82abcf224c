use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::{SessionDescriptor, SessionQuery};
use crate::error::DlError;

/// What to fetch as a zip archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadFilter {
    /// Files of one scan-level resource (usually `DICOM`).
    ScanResource { scan_id: String, resource: String },
    /// Files of one experiment-level resource (e.g. `NORDIC_VOLUMES`).
    SessionResource { resource: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: Option<u64>,
    pub uri: String,
}

/// Remote session catalog. Every call is attempted once; failures surface
/// immediately as transfer errors.
pub trait SessionCatalog: Send + Sync {
    fn find_session(&self, query: &SessionQuery) -> Result<SessionDescriptor, DlError>;
    fn fetch_manifest_xml(&self, session: &SessionDescriptor) -> Result<Vec<u8>, DlError>;
    fn list_resource_files(
        &self,
        session: &SessionDescriptor,
        resource: &str,
    ) -> Result<Vec<RemoteFile>, DlError>;
    fn fetch_payload(
        &self,
        session: &SessionDescriptor,
        filter: &PayloadFilter,
        destination: &Path,
    ) -> Result<(), DlError>;
}

#[derive(Clone)]
pub struct XnatHttpClient {
    client: Client,
    base_url: String,
}

impl XnatHttpClient {
    pub fn new(base_url: &str) -> Result<Self, DlError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cnda-dl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DlError::Transfer(err.to_string()))?,
        );
        // Session archives can take far longer than any fixed request timeout.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|err| DlError::Transfer(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, DlError> {
        self.get_with_query(path, &[])
    }

    fn get_with_query(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::blocking::Response, DlError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .map_err(|err| DlError::Transfer(err.to_string()))?;
        Self::handle_status(response)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, DlError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "XNAT request failed".to_string());
        Err(DlError::TransferStatus { status, message })
    }
}

impl SessionCatalog for XnatHttpClient {
    fn find_session(&self, query: &SessionQuery) -> Result<SessionDescriptor, DlError> {
        let response = self.get_with_query(SESSION_SEARCH_PATH, &session_search_params(query))?;
        let body = response
            .text()
            .map_err(|err| DlError::Transfer(err.to_string()))?;
        let rows = parse_session_rows(&body)?;
        select_single(rows, query)
    }

    fn fetch_manifest_xml(&self, session: &SessionDescriptor) -> Result<Vec<u8>, DlError> {
        let path = format!(
            "/data/projects/{}/subjects/{}",
            encode_path_segment(&session.project),
            encode_path_segment(&session.subject_id)
        );
        let response = self.get_with_query(&path, &[("format", "xml".to_string())])?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| DlError::Transfer(err.to_string()))
    }

    fn list_resource_files(
        &self,
        session: &SessionDescriptor,
        resource: &str,
    ) -> Result<Vec<RemoteFile>, DlError> {
        let path = format!(
            "/data/experiments/{}/resources/{}/files",
            encode_path_segment(&session.experiment_id),
            encode_path_segment(resource)
        );
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("format", "json")])
            .send()
            .map_err(|err| DlError::Transfer(err.to_string()))?;
        // XNAT answers 404 for a resource the session does not have.
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let body = Self::handle_status(response)?
            .text()
            .map_err(|err| DlError::Transfer(err.to_string()))?;
        parse_file_rows(&body)
    }

    fn fetch_payload(
        &self,
        session: &SessionDescriptor,
        filter: &PayloadFilter,
        destination: &Path,
    ) -> Result<(), DlError> {
        let mut response =
            self.get_with_query(&payload_path(session, filter), &[("format", "zip".to_string())])?;
        let mut file = File::create(destination).map_err(|err| {
            DlError::Filesystem(format!("create {}: {err}", destination.display()))
        })?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| DlError::Transfer(format!("payload stream interrupted: {err}")))?;
        Ok(())
    }
}

pub const SESSION_SEARCH_PATH: &str = "/data/experiments";

/// Query parameters of the MR session search. Values are sent through
/// reqwest's query encoder, never spliced into the URL.
pub fn session_search_params(query: &SessionQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("format", "json".to_string()),
        ("xsiType", "xnat:mrSessionData".to_string()),
        (
            "columns",
            "ID,label,project,subject_ID,subject_label".to_string(),
        ),
    ];
    if let Some(project) = &query.project_id {
        params.push(("project", project.clone()));
    }
    if query.is_experiment_id {
        params.push(("ID", query.label_or_id.clone()));
    } else {
        params.push(("subject_label", query.label_or_id.clone()));
    }
    params
}

pub fn payload_path(session: &SessionDescriptor, filter: &PayloadFilter) -> String {
    let experiment = encode_path_segment(&session.experiment_id);
    match filter {
        PayloadFilter::ScanResource { scan_id, resource } => format!(
            "/data/experiments/{experiment}/scans/{}/resources/{}/files",
            encode_path_segment(scan_id),
            encode_path_segment(resource)
        ),
        PayloadFilter::SessionResource { resource } => format!(
            "/data/experiments/{experiment}/resources/{}/files",
            encode_path_segment(resource)
        ),
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
pub fn encode_path_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope<T> {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet<T>,
}

#[derive(Debug, Deserialize)]
struct ResultSet<T> {
    #[serde(rename = "Result", default = "Vec::new")]
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    #[serde(rename = "ID")]
    id: String,
    project: String,
    #[serde(rename = "subject_ID", alias = "xnat:mrsessiondata/subject_id")]
    subject_id: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Size", default)]
    size: Option<serde_json::Value>,
    #[serde(rename = "URI", default)]
    uri: String,
}

pub fn parse_session_rows(body: &str) -> Result<Vec<SessionDescriptor>, DlError> {
    let envelope: ResultEnvelope<SessionRow> = serde_json::from_str(body)
        .map_err(|err| DlError::Transfer(format!("unexpected session search response: {err}")))?;
    Ok(envelope
        .result_set
        .result
        .into_iter()
        .map(|row| SessionDescriptor {
            project: row.project,
            subject_id: row.subject_id,
            experiment_id: row.id,
            label: row.label,
        })
        .collect())
}

pub fn parse_file_rows(body: &str) -> Result<Vec<RemoteFile>, DlError> {
    let envelope: ResultEnvelope<FileRow> = serde_json::from_str(body)
        .map_err(|err| DlError::Transfer(format!("unexpected file listing response: {err}")))?;
    Ok(envelope
        .result_set
        .result
        .into_iter()
        .map(|row| RemoteFile {
            name: row.name,
            size: row.size.and_then(|value| match value {
                serde_json::Value::Number(number) => number.as_u64(),
                serde_json::Value::String(text) => text.trim().parse().ok(),
                _ => None,
            }),
            uri: row.uri,
        })
        .collect())
}

/// A lookup must resolve to exactly one session.
pub fn select_single(
    mut rows: Vec<SessionDescriptor>,
    query: &SessionQuery,
) -> Result<SessionDescriptor, DlError> {
    if rows.len() != 1 {
        return Err(DlError::AmbiguousOrMissingSession {
            query: query.to_string(),
            count: rows.len(),
        });
    }
    Ok(rows.remove(0))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn search_params_by_subject_label() {
        let query = SessionQuery::new("SUBJ01", false, Some("PROJ".to_string())).unwrap();
        let params = session_search_params(&query);
        assert!(params.contains(&("project", "PROJ".to_string())));
        assert_eq!(params.last(), Some(&("subject_label", "SUBJ01".to_string())));
    }

    #[test]
    fn zero_or_many_sessions_is_an_error() {
        let query = SessionQuery::new("CNDA_E1", true, None).unwrap();
        let err = select_single(Vec::new(), &query).unwrap_err();
        assert_matches!(err, DlError::AmbiguousOrMissingSession { count: 0, .. });
    }
}
