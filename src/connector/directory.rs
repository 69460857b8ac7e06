//! Resolves directory user names to the URL of the server they work on.

use backon::{ExponentialBuilder, Retryable};
use moka::sync::Cache;
use std::{sync::LazyLock, time::Duration};
use tracing::debug;
use url::Url;

use crate::error::TetherError;

static LOOKUP_RETRY_POLICY: LazyLock<ExponentialBuilder> = LazyLock::new(|| {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(2)
        .with_jitter()
});

#[derive(Clone)]
pub(crate) struct Directory {
    client: reqwest::Client,
    endpoint: Url,
    cache: Cache<String, Url>,
}

impl Directory {
    pub fn new(endpoint: Url, ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            cache: Cache::builder().time_to_live(ttl).max_capacity(1024).build(),
        }
    }

    pub fn lookup_url(&self, user: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("mode", "rest")
            .append_pair("cmd", "serverURL")
            .append_pair("user", user);
        url
    }

    /// Server URL of `user`. `Ok(None)` when the directory knows no server for it.
    pub async fn server_for_user(&self, user: &str) -> Result<Option<Url>, TetherError> {
        if let Some(url) = self.cache.get(user) {
            return Ok(Some(url));
        }

        let lookup = self.lookup_url(user);
        let body = (|| {
            let client = self.client.clone();
            let lookup = lookup.clone();
            async move {
                let resp = client.get(lookup).send().await?;
                let status = resp.status();
                let body = resp.text().await?;
                if status != reqwest::StatusCode::OK {
                    return Err(TetherError::Config(format!(
                        "Directory answered {status}: {}",
                        body.trim()
                    )));
                }
                Ok(body)
            }
        })
        .retry(*LOOKUP_RETRY_POLICY)
        // Only transport failures are retried; a directory answer is final.
        .when(|e| matches!(e, TetherError::ReqwestError(_)))
        .await?;

        let body = body.trim();
        if body.is_empty() {
            return Ok(None);
        }
        let url = Url::parse(body)?;
        debug!(user, url = %url, "Directory resolved user");
        self.cache.insert(user.to_string(), url.clone());
        Ok(Some(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_url_carries_the_rest_query() {
        let directory = Directory::new(
            Url::parse("https://console.example.com/CCC/").unwrap(),
            Duration::from_secs(60),
        );
        assert_eq!(
            directory.lookup_url("team/alice").as_str(),
            "https://console.example.com/CCC/?mode=rest&cmd=serverURL&user=team%2Falice"
        );
    }

    #[tokio::test]
    async fn cached_users_skip_the_network() {
        let directory = Directory::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_secs(60),
        );
        let url = Url::parse("https://ide.example.com/").unwrap();
        directory.cache.insert("bob".to_string(), url.clone());
        assert_eq!(directory.server_for_user("bob").await.unwrap(), Some(url));
    }
}
