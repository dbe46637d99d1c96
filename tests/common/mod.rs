#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

use tryon::credit::CreditLedger;
use tryon::gateway::{BackendReply, GenerationBackend};
use tryon::request::GenerationRequest;

pub fn init_logging()
{   let _ = env_logger::builder().is_test(true).try_init();
}

/// PNG bytes of a blank image
pub fn png_bytes(width: u32, height: u32) -> Vec<u8>
{   let img = DynamicImage::new_rgb8(width, height);
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// `data:` reference of a blank PNG
pub fn data_ref(width: u32, height: u32) -> String
{   format!(
      "data:image/png;base64,{}",
      STANDARD.encode(png_bytes(width, height))
    )
}

/// Config with millisecond backoff so retry tests stay fast
pub fn fast_config() -> tryon::TryOnConfig
{   let mut config = tryon::TryOnConfig::default();
    config.retry.initial_backoff_ms = 1;
    config
}

/// Script for one style hint: replies in order, optional gate
struct Script
{   replies: VecDeque<BackendReply>
  , gate: Option<Arc<Notify>>
}

/// Backend whose replies are scripted per style hint; requests
/// without a hint use the "" script.
#[derive(Default)]
pub struct ScriptedBackend
{   scripts: Mutex<HashMap<String, Script>>
  , calls: AtomicUsize
  , seen: Mutex<Vec<GenerationRequest>>
}

impl ScriptedBackend
{   pub fn new() -> Arc<Self>
    {   Arc::new(ScriptedBackend::default())
    }

    pub fn script(&self, hint: &str, replies: Vec<BackendReply>)
    {   self.scripts.lock().unwrap().insert(
          hint.to_string(),
          Script { replies: replies.into(), gate: None }
        );
    }

    /// Replies for `hint` wait until the returned gate is notified
    pub fn script_gated(
      &self
    , hint: &str
    , replies: Vec<BackendReply>
    ) -> Arc<Notify>
    {   let gate = Arc::new(Notify::new());
        self.scripts.lock().unwrap().insert(
          hint.to_string(),
          Script { replies: replies.into(), gate: Some(gate.clone()) }
        );
        gate
    }

    pub fn calls(&self) -> usize
    {   self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<GenerationRequest>
    {   self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend
{   async fn send(&self, request: &GenerationRequest) -> BackendReply
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());

        let key = request.style_hint().unwrap_or("").to_string();
        let (reply, gate) = {
          let mut scripts = self.scripts.lock().unwrap();
          match scripts.get_mut(&key)
          {   Some(script) => (
                script.replies.pop_front(),
                script.gate.clone()
              )
            , None => (None, None)
          }
        };
        if let Some(gate) = gate
        {   gate.notified().await;
        }
        reply.unwrap_or_else(|| BackendReply::Failure
        {   status: Some(500)
          , code: None
          , message: format!("no scripted reply for '{}'", key)
        })
    }
}

pub fn image_reply(result_ref: &str) -> BackendReply
{   BackendReply::Image(result_ref.to_string())
}

pub fn unavailable() -> BackendReply
{   BackendReply::Failure
    {   status: Some(503)
      , code: None
      , message: "model overloaded".to_string()
    }
}

/// Ledger with a fixed balance that counts fetches
pub struct FixedLedger
{   balance: AtomicU64
  , fetches: AtomicUsize
}

impl FixedLedger
{   pub fn new(balance: u64) -> Arc<Self>
    {   Arc::new(FixedLedger
        {   balance: AtomicU64::new(balance)
          , fetches: AtomicUsize::new(0)
        })
    }

    pub fn set_balance(&self, balance: u64)
    {   self.balance.store(balance, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize
    {   self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CreditLedger for FixedLedger
{   async fn fetch_balance(&self) -> Result<u64, tryon::Error>
    {   self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.balance.load(Ordering::SeqCst))
    }
}

/// Ledger that answers only after `delay`
pub struct SlowLedger
{   balance: u64
  , delay: Duration
}

impl SlowLedger
{   pub fn new(balance: u64, delay: Duration) -> Arc<Self>
    {   Arc::new(SlowLedger { balance, delay })
    }
}

#[async_trait]
impl CreditLedger for SlowLedger
{   async fn fetch_balance(&self) -> Result<u64, tryon::Error>
    {   tokio::time::sleep(self.delay).await;
        Ok(self.balance)
    }
}

/// Wait for the first reply on a command receiver
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T
{   tokio::time::timeout(Duration::from_secs(10), rx.recv())
      .await
      .expect("timed out waiting for reply")
      .expect("reply channel closed")
}

/// Poll until `cond` holds or a few seconds pass
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool
{   for _ in 0..200
    {   if cond()
        {   return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Serve `body` with `status` to every connection on 127.0.0.1 and
/// return the base URL. Without `advertise_length` the body runs to
/// connection close and carries no Content-Length.
pub async fn serve_http(
  status: &'static str
, body: Vec<u8>
, advertise_length: bool
) -> String
{   let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      while let Ok((mut stream, _)) = listener.accept().await
      {   let mut request = Vec::new();
          let mut buf = [0u8; 1024];
          loop
          {   let n = stream.read(&mut buf).await.unwrap_or(0);
              if n == 0
              {   break;
              }
              request.extend_from_slice(&buf[..n]);
              if request.windows(4).any(|w| w == b"\r\n\r\n")
              {   break;
              }
          }
          let mut head = format!(
            "HTTP/1.1 {}\r\nContent-Type: image/png\r\nConnection: close\r\n",
            status
          );
          if advertise_length
          {   head.push_str(&format!("Content-Length: {}\r\n", body.len()));
          }
          head.push_str("\r\n");
          let _ = stream.write_all(head.as_bytes()).await;
          let _ = stream.write_all(&body).await;
          let _ = stream.shutdown().await;
      }
    });
    format!("http://{}", addr)
}
