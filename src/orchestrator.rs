use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use log::{debug, trace, error, info, warn};

use crate::credit::{CreditLedger, CreditStore};
use crate::error::{ClassifiedError, ErrorKind};
use crate::gateway::{Gateway, GenerationBackend};
use crate::request::RequestBuilder;
use crate::{ImageSlot, ModelSelector, QualityTier, RequestId, TryOnCommand, TryOnFoot};

/// Lifecycle of the current generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase
{   Idle
  , Generating
  , Succeeded
  , Failed
}

/// Observable session state.
///
/// `result_ref` and `error` are both `None` unless the phase is
/// terminal, and never both set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSession
{   pub phase: Phase
  , pub person_image_ref: Option<String>
  , pub garment_image_ref: Option<String>
  , pub result_ref: Option<String>
  , pub error: Option<ClassifiedError>
  , pub request_id: RequestId
}

impl GenerationSession
{   fn new(request_id: RequestId) -> Self
    {   GenerationSession
        {   phase: Phase::Idle
          , person_image_ref: None
          , garment_image_ref: None
          , result_ref: None
          , error: None
          , request_id
        }
    }

    pub fn is_terminal(&self) -> bool
    {   matches!(self.phase, Phase::Succeeded | Phase::Failed)
    }
}

/// How one generate() call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome
{   Succeeded(String)
  , Failed(ClassifiedError)
  , /// A newer call or an input change invalidated this one
    Superseded
}

/// Completion report from a generation task back to the loop
struct Settled
{   request_id: RequestId
  , result: Result<String, ClassifiedError>
  , /// False when the local precheck rejected before any dispatch
    refresh_balance: bool
  , reply: crate::GenerateReplySender
}

/// One generate() call detached from the loop: balance precheck,
/// request build and dispatch
struct GenerationJob
{   request_id: RequestId
  , person_ref: String
  , garment_ref: String
  , quality: QualityTier
  , model: ModelSelector
  , style_hint: Option<String>
  , builder: RequestBuilder
  , gateway: Gateway
  , credits: CreditStore
}

impl GenerationJob
{   /// Local balance oracle; the backend still rejects an empty
    /// balance when the ledger cannot be read
    async fn precheck(&self) -> Result<(), ClassifiedError>
    {   let cost = crate::credit::cost(self.quality, self.model);
        match self.credits.balance_for(cost).await
        {   Ok(balance) if balance < cost => Err(ClassifiedError::new(
              ErrorKind::InsufficientCredit,
              format!("balance {} is below cost {}", balance, cost)
            ))
          , Ok(balance) => {
              trace!("Balance {} covers cost {}", balance, cost);
              Ok(())
            }
          , Err(e) => {
              warn!("Balance unavailable, skipping local check: {}", e);
              Ok(())
            }
        }
    }

    /// Returns the result and whether the backend may have charged
    async fn run(self) -> (Result<String, ClassifiedError>, bool)
    {   if let Err(rejected) = self.precheck().await
        {   return (Err(rejected), false);
        }
        let built = self.builder
          .build(
            &self.person_ref, &self.garment_ref,
            self.quality, self.model, self.style_hint.as_deref()
          )
          .await;
        let result = match built
        {   Ok(request) => self.gateway.dispatch(&request).await
          , Err(e) => {
              error!("Request {} not built: {}", self.request_id, e);
              Err(ClassifiedError::from(e))
            }
        };
        (result, true)
    }
}

/// Orchestrator state owned by the event loop
pub struct OrchestratorState
{   session: GenerationSession
  , next_request_id: u64
  , builder: RequestBuilder
  , gateway: Gateway
  , credits: CreditStore
  , generation_timeout: Duration
  , session_tx: watch::Sender<GenerationSession>
  , settled_tx: mpsc::UnboundedSender<Settled>
}

impl OrchestratorState
{   fn next_request_id(&mut self) -> RequestId
    {   self.next_request_id += 1;
        RequestId(self.next_request_id)
    }

    fn publish(&self)
    {   trace!(
          "Session {} -> {:?}",
          self.session.request_id, self.session.phase
        );
        self.session_tx.send_replace(self.session.clone());
    }

    /// Drop any result or error and invalidate in-flight work
    fn invalidate(&mut self)
    {   self.session.request_id = self.next_request_id();
        self.session.phase = Phase::Idle;
        self.session.result_ref = None;
        self.session.error = None;
    }

    fn fail(&mut self, error: ClassifiedError) -> crate::GenerationOutcome
    {   warn!(
          "Generation {} failed: {}",
          self.session.request_id, error
        );
        self.session.phase = Phase::Failed;
        self.session.result_ref = None;
        self.session.error = Some(error.clone());
        self.publish();
        GenerationOutcome::Failed(error)
    }

    fn handle_set_image(
      &mut self
    , slot: ImageSlot
    , source_ref: String
    ) -> crate::SetImageReply
    {   if source_ref.trim().is_empty()
        {   return Err(crate::error::Error::InvalidInput(
              format!("{:?} image reference is empty", slot)
            ));
        }
        debug!("Setting {:?} image", slot);
        match slot
        {   ImageSlot::Person => {
              self.session.person_image_ref = Some(source_ref)
            }
          , ImageSlot::Garment => {
              self.session.garment_image_ref = Some(source_ref)
            }
        }
        self.invalidate();
        self.publish();
        Ok(self.session.clone())
    }

    fn handle_reset(&mut self) -> crate::ResetReply
    {   debug!("Resetting session");
        self.session = GenerationSession::new(self.next_request_id());
        self.publish();
        Ok(self.session.clone())
    }

    /// Never awaits: the balance check and all network work run in
    /// a spawned task that reports back as `Settled`
    fn handle_generate(&mut self, args: crate::GenerateArgs)
    {   let crate::GenerateArgs { quality, model, style_hint, reply } = args;
        let request_id = self.next_request_id();
        self.session.request_id = request_id;
        debug!(
          "Generate {} requested: {:?}/{:?}",
          request_id, quality, model
        );

        let (person_ref, garment_ref) = match
        (   self.session.person_image_ref.clone()
          , self.session.garment_image_ref.clone()
        )
        {   (Some(person), Some(garment)) => (person, garment)
          , (person, _) => {
              let missing = if person.is_none() { "person" } else { "garment" };
              let outcome = self.fail(ClassifiedError::new(
                ErrorKind::InvalidInput,
                format!("{} image is not set", missing)
              ));
              let _ = reply.send(Ok(outcome));
              return;
            }
        };

        self.session.phase = Phase::Generating;
        self.session.result_ref = None;
        self.session.error = None;
        self.publish();

        let job = GenerationJob
        {   request_id
          , person_ref
          , garment_ref
          , quality
          , model
          , style_hint
          , builder: self.builder.clone()
          , gateway: self.gateway.clone()
          , credits: self.credits.clone()
        };
        let settled_tx = self.settled_tx.clone();
        let timeout = self.generation_timeout;
        tokio::spawn(async move {
          let finished = tokio::time::timeout(timeout, job.run()).await;
          let (result, refresh_balance) = match finished
          {   Ok(done) => done
            , Err(_) => {
                error!("Generation {} timed out", request_id);
                let timed_out = ClassifiedError::new(
                  ErrorKind::TransientBackend,
                  format!("generation timed out after {:?}", timeout)
                );
                (Err(timed_out), true)
              }
          };
          let _ = settled_tx.send(Settled
          {   request_id
            , result
            , refresh_balance
            , reply
          });
        });
    }

    fn handle_settled(&mut self, settled: Settled)
    {   let Settled { request_id, result, refresh_balance, reply } = settled;

        let outcome = if request_id != self.session.request_id
          || self.session.phase != Phase::Generating
        {   debug!(
              "Discarding stale result for {} (current {})",
              request_id, self.session.request_id
            );
            GenerationOutcome::Superseded
        } else
        {   match result
            {   Ok(result_ref) => {
                  info!("Generation {} succeeded", request_id);
                  self.session.phase = Phase::Succeeded;
                  self.session.result_ref = Some(result_ref.clone());
                  self.session.error = None;
                  self.publish();
                  GenerationOutcome::Succeeded(result_ref)
                }
              , Err(error) => self.fail(error)
            }
        };
        let _ = reply.send(Ok(outcome));

        if !refresh_balance
        {   return;
        }
        // Backend owns the ledger; re-read instead of decrementing
        let credits = self.credits.clone();
        tokio::spawn(async move {
          if let Err(e) = credits.refresh().await
          {   warn!("Balance refresh failed: {}", e);
          }
        });
    }
}

/// Public API for the generation core - owns the task
pub struct Orchestrator
{   hand: crate::TryOnHand
  , session_rx: watch::Receiver<GenerationSession>
  , credits: CreditStore
  , _task_handle: tokio::task::JoinHandle<()>
}

impl Orchestrator
{   /// Create and spawn a new orchestrator
    /// Returns immediately - spawns background task
    pub fn new(
      config: &crate::config::TryOnConfig
    , backend: Arc<dyn GenerationBackend>
    , ledger: Arc<dyn CreditLedger>
    ) -> Result<Self, crate::error::Error>
    {   config.validate()?;
        debug!("Creating Orchestrator with task ownership");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();

        let initial = GenerationSession::new(RequestId::default());
        let (session_tx, session_rx) = watch::channel(initial.clone());
        let credits = CreditStore::new(ledger);

        let state = OrchestratorState
        {   session: initial
          , next_request_id: 0
          , builder: RequestBuilder::new(
              crate::normalizer::ImageNormalizer::new(&config.normalizer)
            )
          , gateway: Gateway::new(backend, config.retry_policy())
          , credits: credits.clone()
          , generation_timeout: config.generation_timeout()
          , session_tx
          , settled_tx
        };

        // Warm the balance cache for the first precheck
        let prefetch = credits.clone();
        tokio::spawn(async move {
          if let Err(e) = prefetch.refresh().await
          {   warn!("Initial balance fetch failed: {}", e);
          }
        });

        let foot = crate::TryOnFoot { command_rx };
        let _task_handle = tokio::spawn(async move {
          run_orchestrator_loop(foot, settled_rx, state).await
        });

        Ok(Orchestrator
        {   hand: crate::TryOnHand { command_tx }
          , session_rx
          , credits
          , _task_handle
        })
    }

    /// Orchestrator talking to the HTTP backend and ledger
    pub fn from_config(
      config: &crate::config::TryOnConfig
    ) -> Result<Self, crate::error::Error>
    {   let backend = crate::gateway::HttpBackend::new(&config.gateway)?;
        let ledger = crate::credit::HttpCreditLedger::new(&config.gateway)?;
        Orchestrator::new(config, Arc::new(backend), Arc::new(ledger))
    }

    fn queue(&self, cmd: TryOnCommand)
      -> Result<(), crate::error::Error>
    {   self.hand.command_tx
          .send(cmd)
          .map_err(|_| {
            error!("Orchestrator channel closed");
            crate::error::Error::Disconnected(
              "orchestrator".to_string()
            )
          })
    }

    /// Snapshot of the current session
    pub fn session(&self) -> GenerationSession
    {   self.session_rx.borrow().clone()
    }

    /// Receiver that sees every published session change
    pub fn subscribe(&self) -> watch::Receiver<GenerationSession>
    {   self.session_rx.clone()
    }

    pub fn credits(&self) -> &CreditStore
    {   &self.credits
    }

    /// Select the person photo - returns almost immediately
    pub async fn set_person_image(
      &self
    , source_ref: impl Into<String>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetImageReply>,
        crate::error::Error
      >
    {   self.set_image(ImageSlot::Person, source_ref.into()).await
    }

    /// Select the garment photo - returns almost immediately
    pub async fn set_garment_image(
      &self
    , source_ref: impl Into<String>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetImageReply>,
        crate::error::Error
      >
    {   self.set_image(ImageSlot::Garment, source_ref.into()).await
    }

    async fn set_image(
      &self
    , slot: ImageSlot
    , source_ref: String
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetImageReply>,
        crate::error::Error
      >
    {   debug!("set_image queuing {:?}", slot);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.queue(TryOnCommand::SetImage(crate::SetImageArgs
        {   slot
          , source_ref
          , reply: reply_tx
        }))?;
        Ok(reply_rx)
    }

    /// Start a generation - returns almost immediately; the
    /// receiver yields this call's outcome once it settles
    pub async fn generate(
      &self
    , quality: QualityTier
    , model: ModelSelector
    , style_hint: Option<String>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GenerateReply>,
        crate::error::Error
      >
    {   debug!("generate queuing {:?}/{:?}", quality, model);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.queue(TryOnCommand::Generate(crate::GenerateArgs
        {   quality
          , model
          , style_hint
          , reply: reply_tx
        }))?;
        Ok(reply_rx)
    }

    /// Back to Idle with no images - returns almost immediately
    pub async fn reset(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ResetReply>,
        crate::error::Error
      >
    {   debug!("reset queuing");
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.queue(TryOnCommand::Reset(crate::ResetArgs
        {   reply: reply_tx
        }))?;
        Ok(reply_rx)
    }

    /// Gracefully shutdown the orchestrator
    pub async fn shutdown(self)
      -> Result<(), crate::error::Error>
    {   debug!("Shutting down Orchestrator");
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.queue(TryOnCommand::KillProcess(crate::KillProcessArgs
        {   reply: reply_tx
        }))?;

        if let Some(result) = reply_rx.recv().await
        {   debug!("Orchestrator shutdown confirmed");
            result
        } else
        {   error!("Orchestrator shutdown timeout");
            Err(crate::error::Error::Timeout)
        }
    }
}

/// Main orchestrator event loop
///
/// Commands are handled in arrival order. Generation work runs in
/// spawned tasks and reports back through `settled_rx`, where the
/// request id decides whether it may commit.
async fn run_orchestrator_loop(
  foot: TryOnFoot
, mut settled_rx: mpsc::UnboundedReceiver<Settled>
, mut state: OrchestratorState
)
{   debug!("Starting Orchestrator event loop");
    let TryOnFoot { mut command_rx } = foot;

    loop
    { tokio::select!
      { cmd = command_rx.recv() => {
          match cmd
          {   Some(TryOnCommand::SetImage(args)) => {
                let result = state
                  .handle_set_image(args.slot, args.source_ref);
                let _ = args.reply.send(result);
              }
            , Some(TryOnCommand::Generate(args)) => {
                state.handle_generate(args);
              }
            , Some(TryOnCommand::Reset(args)) => {
                let result = state.handle_reset();
                let _ = args.reply.send(result);
              }
            , Some(TryOnCommand::KillProcess(args)) => {
                let _ = args.reply.send(Ok(()));
                info!("Orchestrator shutting down");
                break;
              }
            , None => {
                debug!("Command channel closed");
                break;
              }
          }
        }
      , Some(settled) = settled_rx.recv() => {
          state.handle_settled(settled);
        }
      }
    }
}
