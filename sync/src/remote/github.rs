//! GitHub remote over the Git Data REST API.
//!
//! Listing reads one recursive tree of the branch head. Commits create the
//! blobs, a tree on top of the head tree, a commit, then move the branch ref;
//! the ref update is the only step visible to other clients, so a failure
//! anywhere before it leaves the branch untouched.

use super::{structure_from_listing, CommitId, CommitRequest, RemoteStore};
use crate::config::GithubConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gitray_engine::{ContentRef, Hash, Layout, Path, StoreStructure};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "gitray";
const FILE_MODE: &str = "100644";

#[derive(Debug, Deserialize)]
struct Sha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: Sha,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: Sha,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

/// Remote backed by a GitHub repository branch.
#[derive(Debug, Clone)]
pub struct GithubRemote {
    client: Client,
    config: GithubConfig,
}

impl GithubRemote {
    pub fn new(config: GithubConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GithubConfig {
        &self.config
    }

    fn url(&self, rest: &str) -> String {
        format!(
            "{}/repos/{}/{}/git/{}",
            self.config.api_url, self.config.owner, self.config.repo, rest
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.config.token))
            .header("Accept", "application/vnd.github+json")
    }

    /// Send and decode, `None` for 404 and the 409 GitHub returns for an
    /// empty repository.
    async fn send_optional<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::RemoteUnavailable(format!(
                "GitHub returned status {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(Some(response.json().await?))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send_optional(request)
            .await?
            .ok_or_else(|| SyncError::RemoteUnavailable("GitHub resource not found".into()))
    }

    async fn head(&self) -> Result<Option<String>> {
        let reference: Option<RefResponse> = self
            .send_optional(self.client.get(self.url(&format!("ref/heads/{}", self.config.branch))))
            .await?;
        Ok(reference.map(|r| r.object.sha))
    }

    async fn create_blob(&self, bytes: &[u8]) -> Result<String> {
        let body = json!({ "content": STANDARD.encode(bytes), "encoding": "base64" });
        let created: Sha = self
            .send(self.client.post(self.url("blobs")).json(&body))
            .await?;
        Ok(created.sha)
    }
}

/// Blob paths and hashes of a recursive tree listing.
fn listing(tree: TreeResponse) -> Result<Vec<(Path, Hash)>> {
    if tree.truncated {
        return Err(SyncError::RemoteUnavailable(
            "tree listing truncated by GitHub".into(),
        ));
    }
    Ok(tree
        .tree
        .into_iter()
        .filter(|e| e.kind == "blob")
        .map(|e| (e.path, e.sha))
        .collect())
}

fn decode_blob(blob: BlobResponse) -> Result<Vec<u8>> {
    if blob.encoding != "base64" {
        return Err(SyncError::RemoteUnavailable(format!(
            "unsupported blob encoding {:?}",
            blob.encoding
        )));
    }
    // GitHub wraps base64 content at 60 columns.
    let compact: String = blob.content.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SyncError::RemoteUnavailable(format!("undecodable blob: {}", e)))
}

/// Tree entries for created blobs and deleted paths.
fn tree_entries(written: &[(Path, String)], deletes: &[Path]) -> Vec<Value> {
    written
        .iter()
        .map(|(path, sha)| json!({ "path": path, "mode": FILE_MODE, "type": "blob", "sha": sha }))
        .chain(
            deletes
                .iter()
                .map(|path| json!({ "path": path, "mode": FILE_MODE, "type": "blob", "sha": null })),
        )
        .collect()
}

#[async_trait]
impl RemoteStore for GithubRemote {
    async fn fetch_structure(&self, layout: &Layout) -> Result<Option<StoreStructure>> {
        let url = format!("{}?recursive=1", self.url(&format!("trees/{}", self.config.branch)));
        let tree: Option<TreeResponse> = self.send_optional(self.client.get(url)).await?;
        match tree {
            Some(tree) => Ok(structure_from_listing(layout, listing(tree)?)),
            None => Ok(None),
        }
    }

    async fn fetch_blob(&self, content: &ContentRef) -> Result<Vec<u8>> {
        let blob: BlobResponse = self
            .send(self.client.get(self.url(&format!("blobs/{}", content.hash))))
            .await?;
        decode_blob(blob)
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitId> {
        let parent = self.head().await?;
        let base_tree = match &parent {
            Some(sha) => {
                let commit: CommitResponse = self
                    .send(self.client.get(self.url(&format!("commits/{}", sha))))
                    .await?;
                Some(commit.tree.sha)
            }
            None => None,
        };

        let mut written = Vec::with_capacity(request.writes.len());
        for write in &request.writes {
            written.push((write.path.clone(), self.create_blob(&write.bytes).await?));
        }

        let mut tree_body = json!({ "tree": tree_entries(&written, &request.deletes) });
        if let Some(base) = &base_tree {
            tree_body["base_tree"] = json!(base);
        }
        let tree: Sha = self
            .send(self.client.post(self.url("trees")).json(&tree_body))
            .await?;

        let parents: Vec<&String> = parent.iter().collect();
        let commit: Sha = self
            .send(self.client.post(self.url("commits")).json(&json!({
                "message": request.message,
                "tree": tree.sha,
                "parents": parents,
            })))
            .await?;

        let ref_name = format!("heads/{}", self.config.branch);
        if parent.is_some() {
            // Not forced: a concurrent commit makes this fail and the batch
            // is retried against the new head.
            let _: Value = self
                .send(
                    self.client
                        .patch(self.url(&format!("refs/{}", ref_name)))
                        .json(&json!({ "sha": commit.sha, "force": false })),
                )
                .await?;
        } else {
            let _: Value = self
                .send(self.client.post(self.url("refs")).json(&json!({
                    "ref": format!("refs/{}", ref_name),
                    "sha": commit.sha,
                })))
                .await?;
        }

        tracing::info!(
            commit = %commit.sha,
            writes = written.len(),
            deletes = request.deletes.len(),
            "Committed to GitHub"
        );
        Ok(commit.sha)
    }
}
