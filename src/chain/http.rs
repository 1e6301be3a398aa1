use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::chain::api::ChainError;

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, ChainError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("btc-ledger-tally/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// GETs `url` and returns the body, turning non-2xx answers into
/// [`ChainError::Status`].
pub(crate) async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, ChainError> {
    log::trace!("[CHAIN] GET {}", url);
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ChainError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

pub(crate) async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T, ChainError> {
    let body = get_text(client, url).await?;
    serde_json::from_str(&body).map_err(|e| ChainError::Decode(format!("{}: {}", url, e)))
}

pub(crate) fn parse_number<T: std::str::FromStr>(body: &str, what: &str) -> Result<T, ChainError> {
    body.trim()
        .parse()
        .map_err(|_| ChainError::Decode(format!("{} is not a number: {:?}", what, body)))
}
