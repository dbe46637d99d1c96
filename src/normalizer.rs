//! Image loading, resizing, and base64 encoding for generation requests.
//!
//! Every source reference is resolved once into an [`ImageSource`],
//! read into memory (remote images are staged on disk first), resized
//! so the longer edge matches the requested dimension and re-encoded
//! as JPEG.

use std::path::PathBuf;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage};
use log::{debug, error, trace};

use crate::request::EncodedImage;

/// Output MIME type for every normalized image.
pub const OUTPUT_MIME_TYPE: &str = "image/jpeg";

/// Where an image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource
{   /// File on local disk (bare path or `file://` URL)
    Local(PathBuf)
  , /// `http(s)://` URL, downloaded before encoding
    Remote(String)
  , /// `data:<mime>;base64,<payload>` reference
    Embedded
    {   mime_type: String
      , data: String
    }
}

impl ImageSource
{   pub fn parse(source_ref: &str)
      -> Result<Self, crate::error::Error>
    {   let source_ref = source_ref.trim();
        if source_ref.is_empty()
        {   return Err(crate::error::Error::InvalidInput(
              "empty image reference".to_string()
            ));
        }

        if source_ref.starts_with("http://")
          || source_ref.starts_with("https://")
        {   return Ok(ImageSource::Remote(source_ref.to_string()));
        }

        if let Some(rest) = source_ref.strip_prefix("data:")
        {   let (header, data) = rest.split_once(',')
              .ok_or_else(|| crate::error::Error::InvalidInput(
                "data reference has no payload".to_string()
              ))?;
            let mime_type = header.strip_suffix(";base64")
              .ok_or_else(|| crate::error::Error::InvalidInput(
                format!("data reference is not base64: {}", header)
              ))?;
            return Ok(ImageSource::Embedded
            {   mime_type: mime_type.to_string()
              , data: data.to_string()
            });
        }

        let path = source_ref.strip_prefix("file://")
          .unwrap_or(source_ref);
        Ok(ImageSource::Local(PathBuf::from(path)))
    }
}

/// Encoding preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant
{   /// Generation input
    Full
  , /// Wardrobe and gallery thumbnails
    Thumbnail
}

impl ImageVariant
{   /// JPEG quality, 1-100
    pub fn quality(self) -> u8
    {   match self
        {   ImageVariant::Full => 80
          , ImageVariant::Thumbnail => 70
        }
    }
}

/// Turns source references into transmittable payloads
#[derive(Debug, Clone)]
pub struct ImageNormalizer
{   http_client: reqwest::Client
  , scratch_dir: Option<PathBuf>
  , max_download_bytes: u64
}

impl Default for ImageNormalizer
{   fn default() -> Self
    {   ImageNormalizer::new(&crate::config::NormalizerConfig::default())
    }
}

impl ImageNormalizer
{   pub fn new(config: &crate::config::NormalizerConfig) -> Self
    {   ImageNormalizer
        {   http_client: reqwest::Client::new()
          , scratch_dir: config.scratch_dir.clone()
          , max_download_bytes: config.max_download_bytes
        }
    }

    /// Normalize a generation input image
    pub async fn normalize(
      &self
    , source_ref: &str
    , max_dimension: u32
    ) -> Result<EncodedImage, crate::error::Error>
    {   self.normalize_variant(
          source_ref, max_dimension, ImageVariant::Full
        ).await
    }

    pub async fn normalize_variant(
      &self
    , source_ref: &str
    , max_dimension: u32
    , variant: ImageVariant
    ) -> Result<EncodedImage, crate::error::Error>
    {   if max_dimension == 0
        {   return Err(crate::error::Error::InvalidInput(
              "max dimension must be positive".to_string()
            ));
        }
        let source = ImageSource::parse(source_ref)?;
        debug!("Normalizing {:?} to {}px", variant, max_dimension);

        let bytes = self.load_bytes(&source).await?;
        trace!("Loaded {} source bytes", bytes.len());

        let quality = variant.quality();
        let jpeg = tokio::task::spawn_blocking(move || {
          encode_resized(&bytes, max_dimension, quality)
        })
        .await
        .map_err(|e| {
          error!("Encode task failed: {}", e);
          crate::error::Error::Encode(e.to_string())
        })??;

        debug!("Encoded to JPEG: {} bytes", jpeg.len());
        Ok(EncodedImage
        {   source_ref: source_ref.to_string()
          , mime_type: OUTPUT_MIME_TYPE.to_string()
          , encoded_payload: STANDARD.encode(&jpeg)
        })
    }

    async fn load_bytes(
      &self
    , source: &ImageSource
    ) -> Result<Vec<u8>, crate::error::Error>
    {   match source
        {   ImageSource::Local(path) => {
              tokio::fs::read(path).await.map_err(|e| {
                error!("Cannot read {}: {}", path.display(), e);
                crate::error::Error::Io(
                  format!("{}: {}", path.display(), e)
                )
              })
            }
          , ImageSource::Remote(url) => self.download(url).await
          , ImageSource::Embedded { mime_type, data } => {
              trace!("Decoding embedded {} payload", mime_type);
              STANDARD.decode(data.as_bytes()).map_err(|e| {
                error!("Embedded payload is not base64: {}", e);
                crate::error::Error::Io(e.to_string())
              })
            }
        }
    }

    /// Download into a scratch file, then read it back. The scratch
    /// file is removed when it goes out of scope. Bodies larger than
    /// `max_download_bytes` are refused before they are buffered.
    async fn download(
      &self
    , url: &str
    ) -> Result<Vec<u8>, crate::error::Error>
    {   debug!("Downloading image: {}", url);
        let mut response = self.http_client
          .get(url)
          .send()
          .await
          .map_err(|e| {
            error!("Download failed: {}", e);
            crate::error::Error::Io(e.to_string())
          })?;

        let status = response.status();
        if !status.is_success()
        {   error!("Download of {} returned {}", url, status);
            return Err(crate::error::Error::Io(
              format!("download returned {}", status)
            ));
        }

        let limit = self.max_download_bytes;
        let too_large = |size: u64| {
          error!("Download of {} is {} bytes, limit {}", url, size, limit);
          crate::error::Error::Io(
            format!("image of {} bytes exceeds limit of {}", size, limit)
          )
        };
        if let Some(length) = response.content_length()
        {   if length > limit
            {   return Err(too_large(length));
            }
        }

        // no Content-Length on chunked bodies
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
          error!("Download body failed: {}", e);
          crate::error::Error::Io(e.to_string())
        })?
        {   let size = (body.len() + chunk.len()) as u64;
            if size > limit
            {   return Err(too_large(size));
            }
            body.extend_from_slice(&chunk);
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("tryon-").suffix(".img");
        let scratch = match &self.scratch_dir
        {   Some(dir) => builder.tempfile_in(dir)?
          , None => builder.tempfile()?
        };
        trace!("Staging download at {}", scratch.path().display());

        tokio::fs::write(scratch.path(), &body).await?;
        let bytes = tokio::fs::read(scratch.path()).await?;
        Ok(bytes)
    }
}

/// Size with the longer edge equal to `max_dimension`, aspect preserved.
pub fn fit_dimensions(
  width: u32
, height: u32
, max_dimension: u32
) -> (u32, u32)
{   let longer = width.max(height).max(1);
    let scale = max_dimension as f64 / longer as f64;
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    if width >= height
    {   (max_dimension, scaled(height))
    } else
    {   (scaled(width), max_dimension)
    }
}

/// Decode, resize and JPEG-encode raw image bytes.
pub fn encode_resized(
  bytes: &[u8]
, max_dimension: u32
, quality: u8
) -> Result<Vec<u8>, crate::error::Error>
{   let img = image::load_from_memory(bytes)?;
    let (width, height) = (img.width(), img.height());
    let (new_width, new_height)
      = fit_dimensions(width, height, max_dimension);
    trace!(
      "Resizing {}x{} -> {}x{}",
      width, height, new_width, new_height
    );

    let resized = if (new_width, new_height) == (width, height)
    {   img
    } else
    {   img.resize_exact(new_width, new_height, FilterType::Lanczos3)
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_with_encoder(
      JpegEncoder::new_with_quality(&mut buffer, quality)
    )?;
    Ok(buffer)
}
