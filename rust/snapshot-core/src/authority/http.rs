// rust/snapshot-core/src/authority/http.rs

//! JSON-over-HTTP client for an external metadata authority.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checkpoint::RegionDescriptor;
use crate::config::AuthorityConfig;
use crate::error::{EngineError, Result};
use crate::iteration::IterationTag;

use super::state::{Allocation, CheckpointRecord, CheckpointState, RegionStatus, StateFilter};
use super::MetadataAuthority;

const CREATE_ENDPOINT: &str = "/createMetadata";
const UPDATE_ENDPOINT: &str = "/updateMetadata";
const QUERY_ENDPOINT: &str = "/getMetadata";
const LIST_ENDPOINT: &str = "/getAllMetadata";

const STATUS_OK: &str = "OK";

/// Characters of an unparseable reply quoted in the error.
const MAX_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct MetadataRequest {
    filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iteration: Option<String>,
    checkpointstate: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    checkpointstate: i32,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    memfd: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    metadata: Vec<ListedRecord>,
}

#[derive(Debug, Deserialize)]
struct ListedRecord {
    filename: String,
    #[serde(default)]
    iteration: String,
    checkpointstate: i32,
    #[serde(default)]
    size: u64,
}

/// Talks to an authority service over HTTP.
///
/// Every call is a blocking `POST` with a JSON body; the answer carries a
/// `status` of `OK` or `ERROR` and a human-readable `message`.
pub struct HttpAuthority {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(config: &AuthorityConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_connect(Some(Duration::from_millis(config.connect_timeout_ms)))
            .timeout_global(Some(Duration::from_millis(config.request_timeout_ms)))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            base_url: config.url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call<Req, Resp>(&self, endpoint: &str, subject: &Path, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let body = serde_json::to_vec(request).map_err(|e| {
            EngineError::serialization(format!("failed to encode authority request: {e}"))
        })?;

        tracing::debug!(%url, subject = %subject.display(), "calling metadata authority");

        let mut response = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&body[..])
            .map_err(|e| match e {
                ureq::Error::StatusCode(code) => {
                    EngineError::authority(subject, format!("{endpoint} answered HTTP {code}"))
                }
                other => EngineError::authority_unreachable_with_source(
                    format!("request to {url} failed"),
                    other,
                ),
            })?;

        let text = response.body_mut().read_to_string().map_err(|e| {
            EngineError::authority_unreachable_with_source(
                format!("failed to read response from {url}"),
                e,
            )
        })?;

        serde_json::from_str(&text).map_err(|e| {
            let excerpt: String = text.chars().take(MAX_EXCERPT_CHARS).collect();
            EngineError::authority(
                subject,
                format!("malformed response from {endpoint}: {e}: {excerpt}"),
            )
        })
    }

    fn metadata_call(&self, endpoint: &str, path: &Path, request: &MetadataRequest) -> Result<MetadataResponse> {
        let response: MetadataResponse = self.call(endpoint, path, request)?;
        if response.status != STATUS_OK {
            return Err(EngineError::authority(path, response.message));
        }
        Ok(response)
    }
}

impl MetadataAuthority for HttpAuthority {
    fn allocate(&self, path: &Path, iteration: &IterationTag, size: u64) -> Result<Allocation> {
        let request = MetadataRequest {
            filename: path_string(path),
            iteration: Some(iteration.to_string()),
            checkpointstate: CheckpointState::Pending.into(),
            size: Some(size),
        };
        let response = self.metadata_call(CREATE_ENDPOINT, path, &request)?;
        let region = region_of(path, &response)?;
        tracing::debug!(path = %path.display(), %region, size, "allocated region");
        Ok(Allocation {
            state: CheckpointState::Pending,
            region,
        })
    }

    fn update(&self, path: &Path, state: CheckpointState) -> Result<()> {
        let request = MetadataRequest {
            filename: path_string(path),
            iteration: None,
            checkpointstate: state.into(),
            size: None,
        };
        self.metadata_call(UPDATE_ENDPOINT, path, &request)?;
        Ok(())
    }

    fn query(&self, path: &Path) -> Result<RegionStatus> {
        let request = MetadataRequest {
            filename: path_string(path),
            iteration: None,
            checkpointstate: StateFilter::ANY_WIRE,
            size: None,
        };
        let response = self.metadata_call(QUERY_ENDPOINT, path, &request)?;
        let state = CheckpointState::try_from(response.checkpointstate)
            .map_err(|e| EngineError::authority(path, e.to_string()))?;
        let region = region_of(path, &response)?;
        Ok(RegionStatus { state, region })
    }

    fn list(&self, filter: StateFilter) -> Result<Vec<CheckpointRecord>> {
        let subject = Path::new(LIST_ENDPOINT);
        let request = MetadataRequest {
            filename: String::new(),
            iteration: None,
            checkpointstate: filter.to_wire(),
            size: None,
        };
        let response: ListResponse = self.call(LIST_ENDPOINT, subject, &request)?;
        if response.status != STATUS_OK {
            return Err(EngineError::authority(subject, response.message));
        }

        let mut records = Vec::with_capacity(response.metadata.len());
        for listed in response.metadata {
            let state = CheckpointState::try_from(listed.checkpointstate)?;
            if !filter.matches(state) {
                continue;
            }
            records.push(CheckpointRecord {
                path: PathBuf::from(listed.filename),
                iteration: listed.iteration,
                state,
                size: listed.size,
                region: None,
                updated_at: None,
            });
        }
        Ok(records)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn region_of(path: &Path, response: &MetadataResponse) -> Result<RegionDescriptor> {
    match (response.pid, response.memfd) {
        (Some(pid), Some(fd)) => Ok(RegionDescriptor::new(pid, fd)),
        _ => Err(EngineError::authority(
            path,
            "response carries no region descriptor",
        )),
    }
}
