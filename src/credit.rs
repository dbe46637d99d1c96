//! Credit balance access and the generation cost table

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use log::{debug, error, trace};

use crate::{ModelSelector, QualityTier};

/// Total credits one generation costs
pub fn cost(quality: QualityTier, model: ModelSelector) -> u64
{   quality.credit_cost() + model.surcharge()
}

/// Read-only view of the externally owned balance
#[async_trait]
pub trait CreditLedger: Send + Sync
{   async fn fetch_balance(&self) -> Result<u64, crate::error::Error>;
}

#[derive(Debug, Deserialize)]
struct BalanceResponse
{   balance: u64
}

/// Ledger backed by the try-on API
#[derive(Debug, Clone)]
pub struct HttpCreditLedger
{   http_client: reqwest::Client
  , api_base: String
  , api_key: Option<String>
}

impl HttpCreditLedger
{   pub fn new(config: &crate::config::GatewayConfig)
      -> Result<Self, crate::error::Error>
    {   let http_client = reqwest::Client::builder()
          .timeout(Duration::from_secs(config.request_timeout_secs))
          .build()
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(HttpCreditLedger
        {   http_client
          , api_base: config.api_base.trim_end_matches('/').to_string()
          , api_key: config.api_key.clone()
        })
    }
}

#[async_trait]
impl CreditLedger for HttpCreditLedger
{   async fn fetch_balance(&self) -> Result<u64, crate::error::Error>
    {   let mut request = self.http_client
          .get(format!("{}/credits/balance", self.api_base));
        if let Some(key) = &self.api_key
        {   request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
          error!("Balance fetch failed: {}", e);
          crate::error::Error::HttpError(e.to_string())
        })?;

        let status = response.status();
        trace!("Balance response status: {}", status);
        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Balance API error: {}", error_text);
            return Err(crate::error::Error::ApiError(
              format!("balance {}: {}", status, error_text)
            ));
        }

        let body: BalanceResponse = response.json().await
          .map_err(|e| {
            error!("Parse error: {}", e);
            crate::error::Error::ParseError(e.to_string())
          })?;
        Ok(body.balance)
    }
}

/// Last known balance, refreshed from the ledger on demand.
#[derive(Clone)]
pub struct CreditStore
{   ledger: Arc<dyn CreditLedger>
  , balance_tx: Arc<watch::Sender<Option<u64>>>
}

impl CreditStore
{   pub fn new(ledger: Arc<dyn CreditLedger>) -> Self
    {   let (balance_tx, _) = watch::channel(None);
        CreditStore
        {   ledger
          , balance_tx: Arc::new(balance_tx)
        }
    }

    /// Cached balance; `None` until the first successful fetch
    pub fn cached(&self) -> Option<u64>
    {   *self.balance_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>>
    {   self.balance_tx.subscribe()
    }

    /// Fetch the authoritative balance and publish it
    pub async fn refresh(&self) -> Result<u64, crate::error::Error>
    {   let balance = self.ledger.fetch_balance().await?;
        debug!("Balance refreshed: {}", balance);
        self.balance_tx.send_replace(Some(balance));
        Ok(balance)
    }

    /// Balance to check a charge of `cost` against. A cached balance
    /// that covers it is used as is; a missing or too-low one is
    /// re-read so a top-up made elsewhere is seen before rejecting.
    pub async fn balance_for(&self, cost: u64)
      -> Result<u64, crate::error::Error>
    {   match self.cached()
        {   Some(balance) if balance >= cost => Ok(balance)
          , _ => self.refresh().await
        }
    }
}
