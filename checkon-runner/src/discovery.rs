// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovering downstream projects through a package-dependents directory.
//!
//! The directory is queried over HTTPS with a blocking client. Only the repository URLs are kept;
//! packages without a repository are skipped.

use crate::errors::DiscoveryError;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// The directory queried by default.
pub const DEFAULT_BASE_URL: &str = "https://libraries.io/api";

/// The number of dependents requested by default.
pub const DEFAULT_LIMIT: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Queries a package-dependents directory for the repositories of dependent packages.
#[derive(Debug)]
pub struct DependentsClient {
    agent: ureq::Agent,
    base_url: String,
}

impl DependentsClient {
    /// Creates a client for the default directory.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Creates a client for a directory served at `base_url`.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the repository URLs of up to `limit` packages that depend on `package`.
    pub fn fetch(
        &self,
        package: &str,
        api_key: &str,
        limit: usize,
    ) -> Result<Vec<String>, DiscoveryError> {
        validate_package_name(package)?;
        let url = format!("{}/pypi/{package}/dependents", self.base_url);
        debug!(%url, limit, "querying dependents");

        let mut response = self
            .agent
            .get(&url)
            .query("api_key", api_key)
            .query("per_page", limit.to_string())
            .call()
            .map_err(|err| DiscoveryError::Request {
                url: url.clone(),
                err: Box::new(err),
            })?;
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|err| DiscoveryError::Request {
                url: url.clone(),
                err: Box::new(err),
            })?;

        let urls = parse_dependents(&body).map_err(|err| DiscoveryError::Parse { url, err })?;
        debug!(count = urls.len(), "found dependents with repositories");
        Ok(urls)
    }
}

impl Default for DependentsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct Dependent {
    #[serde(default)]
    repository_url: Option<String>,
}

/// Extracts repository URLs from a dependents response, in response order.
pub fn parse_dependents(json: &str) -> Result<Vec<String>, serde_json::Error> {
    let dependents: Vec<Dependent> = serde_json::from_str(json)?;
    Ok(dependents
        .into_iter()
        .filter_map(|dependent| dependent.repository_url)
        .map(|url| url.trim().to_owned())
        .filter(|url| !url.is_empty())
        .collect())
}

fn validate_package_name(name: &str) -> Result<(), DiscoveryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DiscoveryError::InvalidPackageName {
            name: name.to_owned(),
        })
    }
}
