use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::NotifyError;

#[derive(Debug, Deserialize)]
struct PriceResponse {
    /// Price in cents of the fiat currency.
    price: i64,
    #[allow(dead_code)]
    stamp: Option<i64>,
}

/// Fetches the current coin price in fiat.
pub struct PriceFeed {
    http: Client,
    url: String,
}

impl PriceFeed {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Current price in whole fiat units.
    pub async fn fetch(&self) -> Result<f64, NotifyError> {
        let resp: PriceResponse = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.price <= 0 {
            return Err(NotifyError::InvalidPrice {
                url: self.url.clone(),
                price: resp.price,
            });
        }
        let price = resp.price as f64 / 100.0;
        debug!(price, "Fetched fiat price");
        Ok(price)
    }
}
