pub mod error;
pub mod config;
pub mod retry;
pub mod normalizer;
pub mod credit;
pub mod request;
pub mod gateway;
pub mod orchestrator;
use serde::{Deserialize, Serialize};

pub use error::{ClassifiedError, Error, ErrorKind};
pub use config::TryOnConfig;
pub use orchestrator::
{   GenerationOutcome
  , GenerationSession
  , Orchestrator
  , Phase
};

/*

tryon is the async generation core behind the virtual try-on app:
two local images in, one validated, credit-gated, retried remote
generation out, reconciled into a single observable session.

tryon/
├── src/
│   ├── lib.rs          # Command types, tiers, models, re-exports
│   ├── error.rs        # Error enum and classified user-facing errors
│   ├── config.rs       # Gateway, retry and normalizer configuration
│   ├── retry.rs        # Exponential backoff retry policy
│   ├── normalizer.rs   # Image source resolution, resize + encode
│   ├── credit.rs       # Balance fetch, cost table, cached balance
│   ├── request.rs      # GenerationRequest and its builder
│   ├── gateway.rs      # Backend trait, HTTP backend, classification
│   └── orchestrator.rs # Session state machine (actor task)
└── tests/

*/

/// TRYON API INTERFACE:

// ===== SetImage =====

pub type SetImageReply = Result<GenerationSession, crate::error::Error>;
pub type SetImageReplySender
  = tokio::sync::mpsc::UnboundedSender<SetImageReply>;

pub struct SetImageArgs
{   pub slot: ImageSlot
  , pub source_ref: String
  , pub reply: SetImageReplySender
}

// ===== Generate =====

pub type GenerateReply = Result<GenerationOutcome, crate::error::Error>;
pub type GenerateReplySender
  = tokio::sync::mpsc::UnboundedSender<GenerateReply>;

pub struct GenerateArgs
{   pub quality: QualityTier
  , pub model: ModelSelector
  , pub style_hint: Option<String>
  , pub reply: GenerateReplySender
}

// ===== Reset =====

pub type ResetReply = Result<GenerationSession, crate::error::Error>;
pub type ResetReplySender
  = tokio::sync::mpsc::UnboundedSender<ResetReply>;

pub struct ResetArgs
{   pub reply: ResetReplySender
}

// ===== KillProcess =====

pub type KillProcessReply = Result<(), crate::error::Error>;
pub type KillProcessReplySender
  = tokio::sync::mpsc::UnboundedSender<KillProcessReply>;

pub struct KillProcessArgs
{   pub reply: KillProcessReplySender
}

/// Commands accepted by the orchestrator task, processed in order
pub enum TryOnCommand
{   SetImage(SetImageArgs)
  , Generate(GenerateArgs)
  , Reset(ResetArgs)
  , KillProcess(KillProcessArgs)
}

// ===== TryOnHand (sender side) =====

pub struct TryOnHand
{   pub command_tx
      : tokio::sync::mpsc::UnboundedSender<TryOnCommand>
}

// ===== TryOnFoot (receiver side) =====

pub struct TryOnFoot
{   pub command_rx
      : tokio::sync::mpsc::UnboundedReceiver<TryOnCommand>
}

/// TRYON STRUCTURES:

/// Which input image a command refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot
{   Person
  , Garment
}

/// Cost/fidelity preset for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier
{   /// Everyday previews
    Standard
  , /// Higher resolution, more inference steps
    Studio
}

impl QualityTier
{   pub const ALL: [QualityTier; 2]
      = [QualityTier::Standard, QualityTier::Studio];

    /// Credits charged for the tier alone
    pub fn credit_cost(self) -> u64
    {   match self
        {   QualityTier::Standard => 1
          , QualityTier::Studio => 2
        }
    }
}

/// Backend inference model, orthogonal to the quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector
{   /// Fast general-purpose try-on model
    Flash
  , /// Higher-fidelity model with better garment detail
    Pro
}

impl ModelSelector
{   pub const ALL: [ModelSelector; 2]
      = [ModelSelector::Flash, ModelSelector::Pro];

    /// Identifier the backend expects on the wire
    pub fn identifier(self) -> &'static str
    {   match self
        {   ModelSelector::Flash => "tryon-flash-v2"
          , ModelSelector::Pro => "tryon-pro-v1"
        }
    }

    /// Credits added on top of the tier cost
    pub fn surcharge(self) -> u64
    {   match self
        {   ModelSelector::Flash => 0
          , ModelSelector::Pro => 1
        }
    }
}

/// Opaque token identifying one generate() call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl std::fmt::Display for RequestId
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {   write!(f, "req-{}", self.0)
    }
}
