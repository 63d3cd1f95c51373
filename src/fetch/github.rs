//! GitHub-backed [`TreeFetcher`] using the git data API.
//!
//! One recursive tree listing, then one blob request per file, decoded from
//! base64. Tokens are optional; public repositories work anonymously within
//! GitHub's unauthenticated rate limit.

use super::TreeFetcher;
use crate::tree::{FileContents, FileSystemTree};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Blob requests in flight at once.
const BLOB_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

pub struct GitHubTreeFetcher {
    api_base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl GitHubTreeFetcher {
    pub fn new(api_base: &str, token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("workspace-sandbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            http,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, fresh: bool) -> anyhow::Result<T> {
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if fresh {
            request = request.header("Cache-Control", "no-cache");
        }

        let resp = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GitHub API request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".to_string());
            anyhow::bail!("GitHub API returned {status} for {url}: {body}");
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("Unexpected response body from {url}"))
    }

    async fn fetch_blob(&self, repo: &str, sha: &str, fresh: bool) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/repos/{repo}/git/blobs/{sha}", self.api_base);
        let blob: BlobResponse = self.get_json(&url, fresh).await?;
        decode_blob(&blob).with_context(|| format!("Failed to decode blob {sha}"))
    }

    async fn fetch(&self, repo: &str, branch: Option<&str>, fresh: bool) -> anyhow::Result<FileSystemTree> {
        validate_repo(repo)?;
        let git_ref = branch
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or("HEAD");
        let url = format!(
            "{}/repos/{repo}/git/trees/{}?recursive=1",
            self.api_base,
            urlencoding::encode(git_ref)
        );

        let listing: TreeResponse = self.get_json(&url, fresh).await?;
        if listing.truncated {
            tracing::warn!("GitHub truncated the tree listing for {repo}@{git_ref}; some files are missing");
        }

        let mut tree = FileSystemTree::new();
        let mut blobs = Vec::new();
        for item in listing.tree {
            match item.kind.as_str() {
                "tree" => {
                    tree.create_dir_all(&item.path)?;
                }
                "blob" => blobs.push(item),
                // Submodule commits have no content to mount.
                other => tracing::debug!("Skipping {other} entry {}", item.path),
            }
        }

        let files: Vec<(String, Vec<u8>)> = futures_util::stream::iter(blobs)
            .map(|item| async move {
                let bytes = self.fetch_blob(repo, &item.sha, fresh).await?;
                Ok::<_, anyhow::Error>((item.path, bytes))
            })
            .buffer_unordered(BLOB_CONCURRENCY)
            .try_collect()
            .await?;

        for (path, bytes) in files {
            tree.insert_file(&path, FileContents::from_bytes(bytes))?;
        }

        tracing::info!("Fetched {} files from {repo}@{git_ref}", tree.file_count());
        Ok(tree)
    }
}

fn validate_repo(repo: &str) -> anyhow::Result<()> {
    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => anyhow::bail!("Repository must be in owner/name form, got {repo:?}"),
    }
}

fn decode_blob(blob: &BlobResponse) -> anyhow::Result<Vec<u8>> {
    match blob.encoding.as_str() {
        "base64" => {
            let cleaned: String = blob.content.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(cleaned)
                .map_err(|e| anyhow::anyhow!("Invalid base64 payload: {e}"))
        }
        "utf-8" => Ok(blob.content.clone().into_bytes()),
        other => anyhow::bail!("Unsupported blob encoding {other}"),
    }
}

#[async_trait]
impl TreeFetcher for GitHubTreeFetcher {
    async fn fetch_tree(&self, repository_id: &str, branch: Option<&str>) -> anyhow::Result<FileSystemTree> {
        self.fetch(repository_id, branch, false).await
    }

    async fn fetch_tree_fresh(
        &self,
        repository_id: &str,
        branch: Option<&str>,
    ) -> anyhow::Result<FileSystemTree> {
        self.fetch(repository_id, branch, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    async fn mock_repo(server: &MockServer, git_ref: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/repos/acme/app/git/trees/{git_ref}")))
            .and(query_param("recursive", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sha": "root",
                "truncated": false,
                "tree": [
                    {"path": "package.json", "type": "blob", "sha": "b1", "mode": "100644"},
                    {"path": "src", "type": "tree", "sha": "t1", "mode": "040000"},
                    {"path": "src/index.js", "type": "blob", "sha": "b2", "mode": "100644"},
                    {"path": "public", "type": "tree", "sha": "t2", "mode": "040000"},
                    {"path": "public/logo.png", "type": "blob", "sha": "b3", "mode": "100644"},
                    {"path": "vendor/lib", "type": "commit", "sha": "c1", "mode": "160000"}
                ]
            })))
            .mount(server)
            .await;

        // GitHub wraps base64 payloads at 60 columns.
        let wrapped = {
            let raw = b64(b"{\"name\":\"app\"}");
            format!("{}\n{}\n", &raw[..8], &raw[8..])
        };
        for (sha, content) in [
            ("b1", wrapped),
            ("b2", b64(b"console.log('hi')")),
            ("b3", b64(&[0x89, 0x50, 0x4e, 0x47, 0xff])),
        ] {
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/app/git/blobs/{sha}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"sha": sha, "content": content, "encoding": "base64"})),
                )
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn builds_tree_from_listing_and_blobs() {
        let server = MockServer::start().await;
        mock_repo(&server, "HEAD").await;
        let fetcher = GitHubTreeFetcher::new(&server.uri(), None).unwrap();

        let tree = fetcher.fetch_tree("acme/app", None).await.unwrap();

        assert_eq!(tree.file("package.json"), Some(&FileContents::from("{\"name\":\"app\"}")));
        assert_eq!(tree.file("src/index.js"), Some(&FileContents::from("console.log('hi')")));
        assert_eq!(
            tree.file("public/logo.png"),
            Some(&FileContents::Bytes(vec![0x89, 0x50, 0x4e, 0x47, 0xff]))
        );
        assert!(tree.get("vendor").is_none());
        assert_eq!(tree.file_count(), 3);
    }

    #[tokio::test]
    async fn branch_is_used_as_ref_and_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/git/trees/develop"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tree": []})))
            .expect(1)
            .mount(&server)
            .await;
        let fetcher = GitHubTreeFetcher::new(&server.uri(), Some("secret".into())).unwrap();

        let tree = fetcher.fetch_tree("acme/app", Some("develop")).await.unwrap();
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn fresh_fetch_bypasses_http_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/git/trees/HEAD"))
            .and(header("Cache-Control", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tree": []})))
            .expect(1)
            .mount(&server)
            .await;
        let fetcher = GitHubTreeFetcher::new(&server.uri(), None).unwrap();

        fetcher.fetch_tree_fresh("acme/app", None).await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/git/trees/HEAD"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;
        let fetcher = GitHubTreeFetcher::new(&server.uri(), None).unwrap();

        let err = fetcher.fetch_tree("acme/app", None).await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }

    #[tokio::test]
    async fn malformed_repository_id_is_rejected() {
        let fetcher = GitHubTreeFetcher::new(GITHUB_API_BASE, None).unwrap();
        assert!(fetcher.fetch_tree("not-a-repo", None).await.is_err());
        assert!(fetcher.fetch_tree("a/b/c", None).await.is_err());
    }
}
