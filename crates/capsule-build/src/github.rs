//! GitHub repository import: URL parsing and snapshot download.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::{BuildError, BuildResult};

/// A repository and optional ref parsed from a GitHub URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubSource {
    pub owner: String,
    pub repo: String,
    pub reference: Option<String>,
}

impl GithubSource {
    /// Snapshot download URL; without a ref the default branch is used.
    pub fn codeload_url(&self, base: &str) -> String {
        format!(
            "{}/{}/{}/zip/{}",
            base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.reference.as_deref().unwrap_or("HEAD")
        )
    }
}

/// Parse `https://github.com/<owner>/<repo>[/tree/<ref>]`. An explicit
/// `reference` takes precedence over one found in the URL.
pub fn parse_github_url(raw: &str, reference: Option<&str>) -> BuildResult<GithubSource> {
    let url = Url::parse(raw.trim()).map_err(|e| BuildError::InvalidSource(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(BuildError::InvalidSource(format!("unsupported scheme {}", url.scheme())));
    }
    match url.host_str() {
        Some("github.com") | Some("www.github.com") => {}
        other => {
            return Err(BuildError::InvalidSource(format!(
                "not a GitHub URL: {}",
                other.unwrap_or("<none>")
            )));
        }
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let (owner, repo) = match segments.as_slice() {
        [owner, repo, ..] => (*owner, repo.trim_end_matches(".git")),
        _ => {
            return Err(BuildError::InvalidSource(
                "expected https://github.com/<owner>/<repo>".into(),
            ));
        }
    };
    if !is_name(owner) || !is_name(repo) {
        return Err(BuildError::InvalidSource(format!("invalid repository {owner}/{repo}")));
    }

    let url_ref = match segments.as_slice() {
        [_, _, "tree", rest @ ..] if !rest.is_empty() => Some(rest.join("/")),
        _ => None,
    };
    let reference = reference
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from)
        .or(url_ref);
    if let Some(r) = &reference
        && (r.contains("..") || r.chars().any(|c| c.is_whitespace() || c == '?' || c == '#'))
    {
        return Err(BuildError::InvalidSource(format!("invalid ref {r}")));
    }

    Ok(GithubSource {
        owner: owner.to_string(),
        repo: repo.to_string(),
        reference,
    })
}

fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Source of repository snapshot archives.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, source: &GithubSource, max_bytes: u64) -> BuildResult<Vec<u8>>;
}

/// Downloads snapshots from GitHub's codeload service.
pub struct CodeloadFetcher {
    client: reqwest::Client,
    base: String,
}

impl CodeloadFetcher {
    pub fn new(base: impl Into<String>, timeout: Duration) -> BuildResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("capsuled/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for CodeloadFetcher {
    async fn fetch(&self, source: &GithubSource, max_bytes: u64) -> BuildResult<Vec<u8>> {
        let url = source.codeload_url(&self.base);
        debug!(%url, "downloading repository snapshot");

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BuildError::Download(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BuildError::InvalidSource(format!(
                "repository {}/{} or ref not found",
                source.owner, source.repo
            )));
        }
        if !status.is_success() {
            return Err(BuildError::Download(format!("{url} returned {status}")));
        }
        if let Some(len) = response.content_length()
            && len > max_bytes
        {
            return Err(BuildError::UploadTooLarge { limit: max_bytes });
        }

        // Content-Length is optional for codeload, so the cap is enforced
        // on the bytes actually received.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BuildError::Download(e.to_string()))?
        {
            if body.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(BuildError::UploadTooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        info!(owner = %source.owner, repo = %source.repo, bytes = body.len(), "snapshot downloaded");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repo_url() {
        let src = parse_github_url("https://github.com/acme/widget", None).unwrap();
        assert_eq!(src.owner, "acme");
        assert_eq!(src.repo, "widget");
        assert_eq!(src.reference, None);
        assert_eq!(
            src.codeload_url("https://codeload.github.com/"),
            "https://codeload.github.com/acme/widget/zip/HEAD"
        );
    }

    #[test]
    fn parses_tree_ref_and_git_suffix() {
        let src = parse_github_url("https://github.com/acme/widget.git/tree/feature/x", None).unwrap();
        assert_eq!(src.repo, "widget");
        assert_eq!(src.reference.as_deref(), Some("feature/x"));
    }

    #[test]
    fn explicit_ref_wins() {
        let src = parse_github_url("https://github.com/acme/widget/tree/main", Some("v1.2.0")).unwrap();
        assert_eq!(src.reference.as_deref(), Some("v1.2.0"));
        assert_eq!(src.codeload_url("https://c.test"), "https://c.test/acme/widget/zip/v1.2.0");
    }

    #[test]
    fn rejects_other_hosts_and_shapes() {
        for bad in [
            "https://gitlab.com/acme/widget",
            "ftp://github.com/acme/widget",
            "https://github.com/acme",
            "not a url",
            "https://github.com/acme/..",
        ] {
            let err = parse_github_url(bad, None).unwrap_err();
            assert_eq!(err.code(), "invalid_source", "{bad}");
        }
        assert!(parse_github_url("https://github.com/a/b", Some("../etc")).is_err());
    }
}
