//! Generation request types and the builder that assembles them

use serde::{Deserialize, Serialize};
use log::{debug, error};

use crate::normalizer::ImageNormalizer;
use crate::{ModelSelector, QualityTier};

/// Transformation semantics attached to every request.
pub const BASE_INSTRUCTIONS: &str
  = "Dress the person in the first image with the garment from the \
     second image. Replace only the clothing covered by the garment. \
     Preserve the person's face, identity, body shape, pose, hair and \
     skin tone exactly. Keep the original background and lighting. \
     Reproduce the garment's color, pattern, texture and fit \
     faithfully.";

/// An image ready to put on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage
{   /// Reference the image was produced from
    pub source_ref: String
  , /// MIME type of the encoded payload
    pub mime_type: String
  , /// Base64 image bytes
    pub encoded_payload: String
}

/// One generation call, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest
{   person_image: EncodedImage
  , garment_image: EncodedImage
  , quality: QualityTier
  , model: ModelSelector
  , style_hint: Option<String>
  , instructions: String
}

impl GenerationRequest
{   /// Assemble a request from already-encoded images
    pub fn new(
      person_image: EncodedImage
    , garment_image: EncodedImage
    , quality: QualityTier
    , model: ModelSelector
    , style_hint: Option<&str>
    ) -> Self
    {   GenerationRequest
        {   person_image
          , garment_image
          , quality
          , model
          , style_hint: style_hint
              .map(str::trim)
              .filter(|h| !h.is_empty())
              .map(str::to_string)
          , instructions: compose_instructions(style_hint)
        }
    }

    pub fn person_image(&self) -> &EncodedImage
    {   &self.person_image
    }

    pub fn garment_image(&self) -> &EncodedImage
    {   &self.garment_image
    }

    pub fn quality(&self) -> QualityTier
    {   self.quality
    }

    pub fn model_id(&self) -> &'static str
    {   self.model.identifier()
    }

    pub fn style_hint(&self) -> Option<&str>
    {   self.style_hint.as_deref()
    }

    /// Fixed instructions plus the style hint, if any
    pub fn instructions(&self) -> &str
    {   &self.instructions
    }
}

/// Longest edge the images are normalized to for a (tier, model) pair
pub fn max_dimension(quality: QualityTier, model: ModelSelector) -> u32
{   match (quality, model)
    {   (QualityTier::Standard, ModelSelector::Flash) => 1024
      , (QualityTier::Standard, ModelSelector::Pro) => 1536
      , (QualityTier::Studio, ModelSelector::Flash) => 1536
      , (QualityTier::Studio, ModelSelector::Pro) => 2048
    }
}

/// Base instructions with the style hint appended, never replacing them
pub fn compose_instructions(style_hint: Option<&str>) -> String
{   match style_hint.map(str::trim).filter(|h| !h.is_empty())
    {   Some(hint) => format!(
          "{}\n\nAdditional styling: {}",
          BASE_INSTRUCTIONS, hint
        )
      , None => BASE_INSTRUCTIONS.to_string()
    }
}

// ===== Builder =====

/// Validates inputs and normalizes both images into a request
#[derive(Debug, Clone)]
pub struct RequestBuilder
{   normalizer: ImageNormalizer
}

impl RequestBuilder
{   pub fn new(normalizer: ImageNormalizer) -> Self
    {   RequestBuilder { normalizer }
    }

    pub async fn build(
      &self
    , person_ref: &str
    , garment_ref: &str
    , quality: QualityTier
    , model: ModelSelector
    , style_hint: Option<&str>
    ) -> Result<GenerationRequest, crate::error::Error>
    {   // Checked before any encoding work starts
        if person_ref.trim().is_empty()
        {   error!("Person image missing");
            return Err(crate::error::Error::InvalidInput(
              "person image is missing".to_string()
            ));
        }
        if garment_ref.trim().is_empty()
        {   error!("Garment image missing");
            return Err(crate::error::Error::InvalidInput(
              "garment image is missing".to_string()
            ));
        }

        let max_dim = max_dimension(quality, model);
        debug!(
          "Building request: {:?}/{} at {}px",
          quality, model.identifier(), max_dim
        );

        let (person_image, garment_image) = tokio::try_join!(
          self.normalizer.normalize(person_ref, max_dim),
          self.normalizer.normalize(garment_ref, max_dim)
        )?;

        Ok(GenerationRequest::new(
          person_image, garment_image, quality, model, style_hint
        ))
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn dimension_grows_with_tier_and_model()
    {   assert_eq!(max_dimension(QualityTier::Standard, ModelSelector::Flash), 1024);
        assert_eq!(max_dimension(QualityTier::Studio, ModelSelector::Pro), 2048);
        for model in ModelSelector::ALL
        {   assert!(
              max_dimension(QualityTier::Studio, model)
                > max_dimension(QualityTier::Standard, model)
            );
        }
        for quality in QualityTier::ALL
        {   assert!(
              max_dimension(quality, ModelSelector::Pro)
                > max_dimension(quality, ModelSelector::Flash)
            );
        }
    }

    #[test]
    fn style_hint_is_appended()
    {   let text = compose_instructions(Some("  tuck the shirt in "));
        assert!(text.starts_with(BASE_INSTRUCTIONS));
        assert!(text.ends_with("Additional styling: tuck the shirt in"));
        assert_eq!(compose_instructions(Some("   ")), BASE_INSTRUCTIONS);
        assert_eq!(compose_instructions(None), BASE_INSTRUCTIONS);
    }

    #[tokio::test]
    async fn empty_refs_fail_before_encoding()
    {   let builder = RequestBuilder::new(ImageNormalizer::default());
        let result = builder.build(
          "", "/does/not/exist.png",
          QualityTier::Standard, ModelSelector::Flash, None
        ).await;
        assert!(matches!(
          result,
          Err(crate::error::Error::InvalidInput(_))
        ));
    }
}
