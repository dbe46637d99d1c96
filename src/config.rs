//! Configuration for the generation gateway, retries and normalization

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

/// Remote backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig
{   /// API base URL
    pub api_base: String
  , /// Bearer token for the backend
    #[serde(default)]
    pub api_key: Option<String>
  , /// Per-attempt request timeout in seconds
    pub request_timeout_secs: u64
}

impl Default for GatewayConfig
{   fn default() -> Self
    {   GatewayConfig
        {   api_base: "https://api.tryon.app/v1".to_string()
          , api_key: None
          , request_timeout_secs: 90
        }
    }
}

/// Retry configuration for transient backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig
{   /// Additional attempts after the first
    pub max_retries: usize
  , /// Backoff multiplier for retries
    pub backoff_multiplier: f32
  , /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64
}

impl Default for RetryConfig
{   fn default() -> Self
    {   RetryConfig
        {   max_retries: 2
          , backoff_multiplier: 2.0
          , initial_backoff_ms: 500
        }
    }
}

/// Image normalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig
{   /// Where downloaded images are staged; system temp dir if unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>
  , /// Largest remote image body accepted, in bytes
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64
}

fn default_max_download_bytes() -> u64
{   25 * 1024 * 1024
}

impl Default for NormalizerConfig
{   fn default() -> Self
    {   NormalizerConfig
        {   scratch_dir: None
          , max_download_bytes: default_max_download_bytes()
        }
    }
}

/// TryOn configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryOnConfig
{   #[serde(default)]
    pub gateway: GatewayConfig
  , #[serde(default)]
    pub retry: RetryConfig
  , #[serde(default)]
    pub normalizer: NormalizerConfig
  , /// Upper bound for one generate() call, retries included
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64
}

fn default_generation_timeout_secs() -> u64
{   300
}

impl Default for TryOnConfig
{   fn default() -> Self
    {   TryOnConfig
        {   gateway: GatewayConfig::default()
          , retry: RetryConfig::default()
          , normalizer: NormalizerConfig::default()
          , generation_timeout_secs: default_generation_timeout_secs()
        }
    }
}

impl TryOnConfig
{   /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str)
      -> Result<Self, crate::error::Error>
    {   let config: TryOnConfig = serde_json::from_str(json)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>)
      -> Result<Self, crate::error::Error>
    {   let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), crate::error::Error>
    {   if self.gateway.api_base.trim().is_empty()
        {   return Err(crate::error::Error::InvalidConfiguration(
              "gateway.api_base is empty".to_string()
            ));
        }
        if self.gateway.request_timeout_secs == 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "gateway.request_timeout_secs must be > 0".to_string()
            ));
        }
        if self.generation_timeout_secs == 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "generation_timeout_secs must be > 0".to_string()
            ));
        }
        if self.normalizer.max_download_bytes == 0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "normalizer.max_download_bytes must be > 0".to_string()
            ));
        }
        if self.retry.backoff_multiplier < 1.0
        {   return Err(crate::error::Error::InvalidConfiguration(
              "retry.backoff_multiplier must be >= 1.0".to_string()
            ));
        }
        Ok(())
    }

    pub fn generation_timeout(&self) -> Duration
    {   Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy
    {   crate::retry::RetryPolicy::from(&self.retry)
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn partial_json_fills_defaults()
    {   let config = TryOnConfig::from_json_str(
          r#"{ "generation_timeout_secs": 120,
               "gateway": { "api_base": "http://localhost:9000",
                            "request_timeout_secs": 30 } }"#
        ).unwrap();
        assert_eq!(config.gateway.api_base, "http://localhost:9000");
        assert_eq!(config.retry.max_retries, 2);
        assert!(config.normalizer.scratch_dir.is_none());
        assert_eq!(config.normalizer.max_download_bytes, 25 * 1024 * 1024);
        assert_eq!(config.generation_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_zero_timeout()
    {   let result = TryOnConfig::from_json_str(
          r#"{ "generation_timeout_secs": 0 }"#
        );
        assert!(matches!(
          result,
          Err(crate::error::Error::InvalidConfiguration(_))
        ));
    }
}
