// Fetcher contract and a concrete HTTP implementation against a
// GitHub-shaped refs API. The core never depends on this module directly;
// it only depends on the `Fetcher` trait.

use anyhow::Context;

use crate::refs::RefSnapshot;

pub trait Fetcher: Send + Sync + 'static {
    fn fetch_refs(
        &self,
    ) -> impl std::future::Future<Output = anyhow::Result<RefSnapshot>> + Send;
}

/// Polls `GET /repos/{owner}/{repo}/git/refs` on a GitHub-compatible host.
pub struct HttpRefFetcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpRefFetcher {
    pub fn new(api_base: &str, owner: &str, repo: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/repos/{}/{}/git/refs", api_base.trim_end_matches('/'), owner, repo),
            token,
        }
    }
}

impl Fetcher for HttpRefFetcher {
    async fn fetch_refs(&self) -> anyhow::Result<RefSnapshot> {
        let mut req = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "build-monitor");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.context("fetching refs")?;
        let response = response.error_for_status().context("refs request failed")?;
        let body = response.text().await.context("reading refs response body")?;
        parse_refs(&body)
    }
}

/// Parses a refs API response. Split out from `fetch_refs` so malformed-JSON
/// handling is directly unit-testable without a live HTTP server.
fn parse_refs(body: &str) -> anyhow::Result<RefSnapshot> {
    serde_json::from_str(body).context("parsing refs snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_snapshot() {
        let sha = "a".repeat(40);
        let body = format!(r#"[{{"ref": "refs/heads/main", "object": {{"sha": "{sha}"}}}}]"#);
        let snapshot = parse_refs(&body).expect("should parse");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "refs/heads/main");
        assert_eq!(snapshot[0].sha(), &sha);
    }

    #[test]
    fn ignores_additional_fields() {
        let body = r#"[{"ref": "refs/heads/main", "object": {"sha": "deadbeef", "type": "commit"}, "node_id": "xyz"}]"#;
        let snapshot = parse_refs(body).expect("should parse");
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn rejects_malformed_snapshot() {
        assert!(parse_refs("not json").is_err());
        assert!(parse_refs(r#"[{"ref": "refs/heads/main"}]"#).is_err());
    }
}
