mod common;

use std::sync::Arc;

use tryon::config::TryOnConfig;
use tryon::credit::{CreditLedger, HttpCreditLedger};
use tryon::gateway::{BackendReply, Gateway, HttpBackend};
use tryon::normalizer::ImageNormalizer;
use tryon::request::{EncodedImage, GenerationRequest, RequestBuilder};
use tryon::retry::RetryPolicy;
use tryon::{ErrorKind, ModelSelector, QualityTier};

use common::*;

fn tiny_request(hint: Option<&str>) -> GenerationRequest
{   let image = |name: &str| EncodedImage
    {   source_ref: name.to_string()
      , mime_type: "image/jpeg".to_string()
      , encoded_payload: "/9j/".to_string()
    };
    GenerationRequest::new(
      image("person"), image("garment"),
      QualityTier::Standard, ModelSelector::Flash, hint
    )
}

/// Load live test configuration from a JSON file
fn load_live_config() -> Option<TryOnConfig>
{   let path = std::env::var("TRYON_TEST_CONFIG")
      .unwrap_or_else(|_| "tests/tryon.json".to_string());
    match TryOnConfig::load(&path)
    {   Ok(config) => Some(config)
      , Err(e) => {
          println!("Skipping: cannot load {}: {}", path, e);
          None
        }
    }
}

#[tokio::test]
async fn test_gateway_returns_last_error_after_retries()
{   init_logging();
    let backend = ScriptedBackend::new();
    backend.script("", vec![
      unavailable(),
      BackendReply::Transport
      {   message: "connection reset".to_string()
        , transient: true
      },
      BackendReply::Failure
      {   status: Some(504)
        , code: None
        , message: "upstream timeout".to_string()
      },
      image_reply("never"),
    ]);
    let gateway = Gateway::new(backend.clone(), RetryPolicy::new(2, 2.0, 1));

    let err = gateway.dispatch(&tiny_request(None)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransientBackend);
    assert!(err.raw_message.contains("upstream timeout"));
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_gateway_does_not_retry_unknown()
{   let backend = ScriptedBackend::new();
    backend.script("", vec![
      BackendReply::Failure
      {   status: Some(401)
        , code: Some("unauthorized".to_string())
        , message: "bad token".to_string()
      },
      image_reply("never"),
    ]);
    let gateway = Gateway::new(backend.clone(), RetryPolicy::new(2, 2.0, 1));

    let err = gateway.dispatch(&tiny_request(None)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unknown);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_gateway_without_retries_makes_one_attempt()
{   let backend = ScriptedBackend::new();
    backend.script("x", vec![unavailable(), image_reply("never")]);
    let gateway = Gateway::new(backend.clone(), RetryPolicy::none());

    let err = gateway.dispatch(&tiny_request(Some("x"))).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(backend.calls(), 1);
}

#[test]
fn test_http_clients_build_from_default_config()
{   let config = TryOnConfig::default();
    assert!(HttpBackend::new(&config.gateway).is_ok());
    assert!(HttpCreditLedger::new(&config.gateway).is_ok());
    assert!(config.validate().is_ok());
}

#[tokio::test]
#[ignore]
async fn test_live_balance()
{   let Some(config) = load_live_config() else { return };
    let ledger = HttpCreditLedger::new(&config.gateway).unwrap();
    match ledger.fetch_balance().await
    {   Ok(balance) => println!("Balance: {}", balance)
      , Err(e) => println!("Balance fetch failed: {}", e)
    }
}

#[tokio::test]
#[ignore]
async fn test_live_generation()
{   let Some(config) = load_live_config() else { return };
    let person = std::env::var("TRYON_PERSON_IMAGE").ok();
    let garment = std::env::var("TRYON_GARMENT_IMAGE").ok();
    let (Some(person), Some(garment)) = (person, garment) else
    {   println!("Skipping: TRYON_PERSON_IMAGE/TRYON_GARMENT_IMAGE not set");
        return;
    };

    let builder = RequestBuilder::new(ImageNormalizer::new(&config.normalizer));
    let request = builder
      .build(&person, &garment, QualityTier::Standard, ModelSelector::Flash, None)
      .await
      .unwrap();
    let gateway = Gateway::new(
      Arc::new(HttpBackend::new(&config.gateway).unwrap()),
      config.retry_policy()
    );
    match gateway.dispatch(&request).await
    {   Ok(result_ref) => {
          println!("Result: {}", &result_ref[..80.min(result_ref.len())]);
          assert!(!result_ref.is_empty());
        }
      , Err(e) => println!("Generation failed: {} ({})", e, e.user_message)
    }
}
