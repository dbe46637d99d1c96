//! Remote generation gateway: backend transport, response
//! classification and transient-failure retry.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use log::{debug, error, trace, warn};

use crate::error::{ClassifiedError, ErrorKind};
use crate::request::GenerationRequest;
use crate::retry::RetryPolicy;
use crate::QualityTier;

/// HTTP statuses worth retrying
pub const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Error codes the backend uses for an empty balance
pub const INSUFFICIENT_BALANCE_CODES: [&str; 2]
  = ["insufficient_balance", "insufficient_credits"];

/// Error codes the backend uses when it declines the content
pub const CONTENT_REFUSAL_CODES: [&str; 2]
  = ["content_refused", "content_policy"];

/// What a single backend call produced, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendReply
{   /// Generated image as a URL or data reference
    Image(String)
  , /// Explanatory text and no image
    Text(String)
  , /// Error envelope or non-success status
    Failure
    {   status: Option<u16>
      , code: Option<String>
      , message: String
    }
  , /// The request never got a response
    Transport
    {   message: String
      , transient: bool
    }
}

/// Inference backend transport
#[async_trait]
pub trait GenerationBackend: Send + Sync
{   async fn send(&self, request: &GenerationRequest) -> BackendReply;
}

/// Map a backend reply to a result reference or a classified error
pub fn classify(reply: BackendReply) -> Result<String, ClassifiedError>
{   match reply
    {   BackendReply::Image(result_ref) => Ok(result_ref)
      , BackendReply::Text(text) => {
          if text.trim().is_empty()
          {   return Err(ClassifiedError::new(
                ErrorKind::Unknown,
                "backend returned neither image nor text"
              ));
          }
          warn!("Backend refused content: {}", text);
          Err(ClassifiedError::new(ErrorKind::ContentRefusal, text))
        }
      , BackendReply::Failure { status, code, message } => {
          let code_is = |set: &[&str]| {
            code.as_deref().map_or(false, |c| set.contains(&c))
          };
          let kind = if status == Some(402)
            || code_is(&INSUFFICIENT_BALANCE_CODES[..])
          {   ErrorKind::InsufficientCredit
          } else if code_is(&CONTENT_REFUSAL_CODES[..])
          {   ErrorKind::ContentRefusal
          } else if status.map_or(false, |s| TRANSIENT_STATUSES.contains(&s))
          {   ErrorKind::TransientBackend
          } else if matches!(status, Some(400) | Some(413) | Some(422))
            || code_is(&["invalid_input"][..])
          {   ErrorKind::InvalidInput
          } else
          {   ErrorKind::Unknown
          };
          let raw = match (status, code)
          {   (Some(s), Some(c)) => format!("{} {}: {}", s, c, message)
            , (Some(s), None) => format!("{}: {}", s, message)
            , (None, Some(c)) => format!("{}: {}", c, message)
            , (None, None) => message
          };
          Err(ClassifiedError::new(kind, raw))
        }
      , BackendReply::Transport { message, transient } => {
          let kind = if transient
          {   ErrorKind::TransientBackend
          } else
          {   ErrorKind::Unknown
          };
          Err(ClassifiedError::new(kind, message))
        }
    }
}

/// Dispatches requests with retry on transient failures
#[derive(Clone)]
pub struct Gateway
{   backend: Arc<dyn GenerationBackend>
  , retry: RetryPolicy
}

impl Gateway
{   pub fn new(
      backend: Arc<dyn GenerationBackend>
    , retry: RetryPolicy
    ) -> Self
    {   Gateway { backend, retry }
    }

    pub async fn dispatch(
      &self
    , request: &GenerationRequest
    ) -> Result<String, ClassifiedError>
    {   debug!(
          "Dispatching {} ({:?})",
          request.model_id(), request.quality()
        );
        let backend = &self.backend;
        let result = self.retry.run(
          |attempt| async move {
            trace!("Generation attempt {}", attempt + 1);
            classify(backend.send(request).await)
          },
          |e: &ClassifiedError| e.is_retryable()
        ).await;

        match &result
        {   Ok(_) => debug!("Generation succeeded")
          , Err(e) => error!("Generation failed: {}", e)
        }
        result
    }
}

// ===== HTTP backend =====

#[derive(Debug, Serialize)]
struct WireImage<'a>
{   mime_type: &'a str
  , data: &'a str
}

#[derive(Debug, Serialize)]
struct WireRequest<'a>
{   model: &'a str
  , quality: QualityTier
  , person_image: WireImage<'a>
  , garment_image: WireImage<'a>
  , instructions: &'a str
  , #[serde(skip_serializing_if = "Option::is_none")]
    style_hint: Option<&'a str>
}

#[derive(Debug, Deserialize)]
struct WireImagePayload
{   mime_type: String
  , data: String
}

#[derive(Debug, Deserialize)]
struct WireError
{   #[serde(default)]
    code: Option<String>
  , #[serde(default)]
    message: Option<String>
}

#[derive(Debug, Deserialize)]
struct WireResponse
{   #[serde(default)]
    image: Option<WireImagePayload>
  , #[serde(default)]
    image_url: Option<String>
  , #[serde(default)]
    text: Option<String>
  , #[serde(default)]
    error: Option<WireError>
}

/// Turn a raw HTTP status and body into a backend reply
pub fn parse_response(status: u16, body: &str) -> BackendReply
{   let success = (200..300).contains(&status);
    let mut parsed: WireResponse = match serde_json::from_str(body)
    {   Ok(parsed) => parsed
      , Err(e) => {
          trace!("Unparseable body ({}): {}", e, body);
          return BackendReply::Failure
          {   status: Some(status)
            , code: None
            , message: if success
              {   format!("unparseable response: {}", e)
              } else
              {   body.to_string()
              }
          };
        }
    };

    if let Some(err) = parsed.error
    {   return BackendReply::Failure
        {   status: Some(status)
          , code: err.code
          , message: err.message
              .unwrap_or_else(|| "Unknown error".to_string())
        };
    }
    if success
    {   if let Some(image) = parsed.image
        {   return BackendReply::Image(format!(
              "data:{};base64,{}", image.mime_type, image.data
            ));
        }
        if let Some(url) = parsed.image_url
        {   return BackendReply::Image(url);
        }
        if let Some(text) = parsed.text.take()
        {   return BackendReply::Text(text);
        }
    }
    BackendReply::Failure
    {   status: Some(status)
      , code: None
      , message: parsed.text
          .unwrap_or_else(|| "response carried no image".to_string())
    }
}

/// Backend speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend
{   http_client: reqwest::Client
  , api_base: String
  , api_key: Option<String>
}

impl HttpBackend
{   pub fn new(config: &crate::config::GatewayConfig)
      -> Result<Self, crate::error::Error>
    {   let http_client = reqwest::Client::builder()
          .timeout(Duration::from_secs(config.request_timeout_secs))
          .build()
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(HttpBackend
        {   http_client
          , api_base: config.api_base.trim_end_matches('/').to_string()
          , api_key: config.api_key.clone()
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend
{   async fn send(&self, request: &GenerationRequest) -> BackendReply
    {   let person = request.person_image();
        let garment = request.garment_image();
        let body = WireRequest
        {   model: request.model_id()
          , quality: request.quality()
          , person_image: WireImage
            {   mime_type: &person.mime_type
              , data: &person.encoded_payload
            }
          , garment_image: WireImage
            {   mime_type: &garment.mime_type
              , data: &garment.encoded_payload
            }
          , instructions: request.instructions()
          , style_hint: request.style_hint()
        };

        let mut http_request = self.http_client
          .post(format!("{}/generate", self.api_base))
          .json(&body);
        if let Some(key) = &self.api_key
        {   http_request = http_request.bearer_auth(key);
        }

        let response = match http_request.send().await
        {   Ok(response) => response
          , Err(e) => {
              error!("HTTP error: {}", e);
              return BackendReply::Transport
              {   transient: e.is_timeout() || e.is_connect()
                , message: e.to_string()
              };
            }
        };

        let status = response.status().as_u16();
        trace!("Generation response status: {}", status);
        match response.text().await
        {   Ok(text) => parse_response(status, &text)
          , Err(e) => {
              error!("Failed to read response body: {}", e);
              BackendReply::Transport
              {   transient: e.is_timeout()
                , message: e.to_string()
              }
            }
        }
    }
}
