use crate::error::{PkgupError, Result};
use crate::index::PackageIndex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_INDEX_URL: &str = "https://pypi.org";
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Client for the PyPI JSON API (`/pypi/<name>/json`)
pub struct PyPiIndex {
    client: Client,
    base_url: Url,
}

impl PyPiIndex {
    pub fn with_base_url(base_url: &str, allow_private: bool) -> Result<Self> {
        let base_url = Self::validate_index_url(base_url, allow_private)?;
        Ok(Self {
            client: Self::build_client()?,
            base_url,
        })
    }

    fn project_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PkgupError::Config(format!("Index URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["pypi", name, "json"]);
        Ok(url)
    }

    fn fetch_versions(&self, name: &str) -> Result<Vec<String>> {
        let url = self.project_url(name)?;
        tracing::debug!(package = name, url = %url, "querying package index");

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| PkgupError::IndexUnavailable(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PkgupError::PackageNotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(PkgupError::IndexUnavailable(format!("HTTP {status} from {url}")));
        }

        let text = response
            .text()
            .map_err(|e| PkgupError::IndexUnavailable(format!("{url}: {e}")))?;

        if text.len() > MAX_RESPONSE_BYTES {
            return Err(PkgupError::IndexUnavailable(format!(
                "Index response for '{name}' exceeded 10MB limit"
            )));
        }

        let versions = versions_from_response(&text)?;
        tracing::debug!(package = name, count = versions.len(), "index returned versions");
        Ok(versions)
    }

    fn build_client() -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("pkgup/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| PkgupError::Io(std::io::Error::other(e)))
    }

    fn validate_index_url(url: &str, allow_private: bool) -> Result<Url> {
        let parsed = Url::parse(url)
            .map_err(|_| PkgupError::Config(format!("Invalid index URL: {url}")))?;

        match parsed.scheme() {
            "https" | "http" => {}
            scheme => {
                return Err(PkgupError::Config(format!(
                    "Unsupported index scheme: {scheme}"
                )));
            }
        }

        if !allow_private {
            if let Some(host) = parsed.host_str() {
                if Self::is_private_host(host) {
                    return Err(PkgupError::Config(format!(
                        "Index host '{host}' is not allowed"
                    )));
                }
            }
        }

        Ok(parsed)
    }

    fn is_private_host(host: &str) -> bool {
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            match ip {
                IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
                IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local(),
            }
        } else {
            false
        }
    }
}

impl PackageIndex for PyPiIndex {
    fn list_versions(&self, name: &str) -> Result<Vec<String>> {
        self.fetch_versions(name)
    }
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    releases: HashMap<String, Vec<ReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    #[serde(default)]
    yanked: bool,
}

/// Extract installable versions: releases with at least one file that is not yanked.
fn versions_from_response(body: &str) -> Result<Vec<String>> {
    let project: ProjectResponse = serde_json::from_str(body)?;
    let mut versions: Vec<String> = project
        .releases
        .into_iter()
        .filter(|(_, files)| files.iter().any(|f| !f.yanked))
        .map(|(version, _)| version)
        .collect();
    versions.sort();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_index() {
        assert!(PyPiIndex::validate_index_url("https://pypi.org", false).is_ok());
    }

    #[test]
    fn rejects_invalid_scheme() {
        let err = PyPiIndex::validate_index_url("ftp://example.com", false).unwrap_err();
        assert!(matches!(err, PkgupError::Config(_)));
    }

    #[test]
    fn rejects_private_host_unless_allowed() {
        let err = PyPiIndex::validate_index_url("http://127.0.0.1:8080", false).unwrap_err();
        assert!(matches!(err, PkgupError::Config(_)));
        assert!(PyPiIndex::validate_index_url("http://127.0.0.1:8080", true).is_ok());
    }

    #[test]
    fn builds_project_url() {
        let index = PyPiIndex::with_base_url("https://mirror.example.com/simple/", false).unwrap();
        let url = index.project_url("requests").unwrap();
        assert_eq!(
            url.as_str(),
            "https://mirror.example.com/simple/pypi/requests/json"
        );
    }

    #[test]
    fn drops_yanked_and_empty_releases() {
        let body = r#"{
            "info": {"name": "requests", "version": "2.2"},
            "releases": {
                "2.0": [{"filename": "a.whl", "yanked": false}],
                "2.1": [{"filename": "b.whl", "yanked": true}],
                "2.2": [{"filename": "c.whl"}, {"filename": "c.tar.gz", "yanked": true}],
                "2.3": []
            }
        }"#;
        let versions = versions_from_response(body).unwrap();
        assert_eq!(versions, vec!["2.0".to_string(), "2.2".to_string()]);
    }

    #[test]
    fn malformed_body_is_json_error() {
        let err = versions_from_response("<html>").unwrap_err();
        assert!(matches!(err, PkgupError::Json(_)));
    }
}
