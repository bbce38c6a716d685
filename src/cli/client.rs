use anyhow::{anyhow, bail, Context};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

/// Thin JSON client for the migration HTTP API
pub struct MigrationClient {
    http: Client,
    base_url: url::Url,
    token: Option<String>,
}

impl MigrationClient {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let base_url = url::Url::parse(base_url)
            .with_context(|| format!("invalid server URL '{}'", base_url))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn endpoint(&self, path: &str) -> anyhow::Result<url::Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid API path '{}'", path))
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let mut request = self.http.get(self.endpoint(path)?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Self::read(request.send().await.context("request failed")?).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let mut request = self.http.post(self.endpoint(path)?).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Self::read(request.send().await.context("request failed")?).await
    }

    /// Unwrap the success envelope, or turn the error envelope into an error
    async fn read(response: Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("server returned {} without a JSON body", status))?;

        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("request failed");
            let code = body["code"].as_str().unwrap_or("ERROR");
            bail!("{} ({}): {}", code, status.as_u16(), message);
        }

        body.get("data")
            .cloned()
            .ok_or_else(|| anyhow!("response is missing the data envelope"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_onto_base_url() {
        let client = MigrationClient::new("http://localhost:3000", None).unwrap();
        assert_eq!(
            client.endpoint("/api/migration/status/42").unwrap().as_str(),
            "http://localhost:3000/api/migration/status/42"
        );
        assert!(MigrationClient::new("not a url", None).is_err());
    }
}
