//! Image normalizer
//!
//! Canonicalizes generated images before they may enter slide history or a
//! pending bundle:
//! - Loads the source (inline `data:` URL or remote URL)
//! - Decodes it and paints it onto a fresh RGBA surface
//! - Re-encodes the surface as a PNG data URL
//!
//! Failures are per image. A batch normalization returns one result per
//! input so a bad candidate never takes its siblings down with it.

use crate::config::EngineConfig;
use crate::error::NormalizationError;
use crate::types::{ImageRef, ImageRefKind, NormalizedImage};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;

/// Source of remote image bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the raw bytes behind `url`
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, NormalizationError>;
}

/// `reqwest`-backed fetcher
#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    /// Create with a default client
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a preconfigured client
    #[inline]
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, NormalizationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NormalizationError::LoadFailure(format!("fetch {url}: {e}")))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| NormalizationError::LoadFailure(format!("read {url}: {e}")))?;

        Ok(bytes.to_vec())
    }
}

/// Image normalizer
#[derive(Clone)]
pub struct ImageNormalizer {
    fetcher: Arc<dyn ImageFetcher>,
    max_pixels: u64,
}

impl std::fmt::Debug for ImageNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageNormalizer")
            .field("max_pixels", &self.max_pixels)
            .finish_non_exhaustive()
    }
}

impl ImageNormalizer {
    /// Create a normalizer that fetches remote images over HTTP
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_fetcher(Arc::new(HttpImageFetcher::new()), config)
    }

    /// Create with a custom fetcher
    #[must_use]
    pub fn with_fetcher(fetcher: Arc<dyn ImageFetcher>, config: &EngineConfig) -> Self {
        Self {
            fetcher,
            max_pixels: config.max_image_pixels,
        }
    }

    /// Normalize one image
    ///
    /// # Errors
    /// - `LoadFailure` if the source cannot be fetched or decoded
    /// - `RenderContextFailure` if no surface can be acquired for it
    pub async fn normalize(&self, image: &ImageRef) -> Result<NormalizedImage, NormalizationError> {
        let bytes = self.load(image).await?;
        let max_pixels = self.max_pixels;

        tokio::task::spawn_blocking(move || normalize_bytes(&bytes, max_pixels))
            .await
            .map_err(|e| NormalizationError::RenderContextFailure(format!("render worker: {e}")))?
    }

    /// Normalize a batch concurrently, one result per input
    pub async fn normalize_all(
        &self,
        images: &[ImageRef],
    ) -> Vec<Result<NormalizedImage, NormalizationError>> {
        futures::future::join_all(images.iter().map(|image| self.normalize(image))).await
    }

    /// Normalize generated candidates together with their prompts
    ///
    /// Candidates that fail are dropped along with their prompt so the two
    /// lists stay parallel.
    ///
    /// # Errors
    /// Returns the first failure if no candidate survives. An empty input
    /// yields an empty output.
    pub async fn normalize_candidates(
        &self,
        candidates: Vec<(ImageRef, String)>,
    ) -> Result<Vec<(NormalizedImage, String)>, NormalizationError> {
        let (images, prompts): (Vec<_>, Vec<_>) = candidates.into_iter().unzip();
        let results = self.normalize_all(&images).await;

        let mut kept = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (index, (result, prompt)) in results.into_iter().zip(prompts).enumerate() {
            match result {
                Ok(image) => kept.push((image, prompt)),
                Err(e) => {
                    tracing::warn!(candidate = index, error = %e, "dropping candidate");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if kept.is_empty() => Err(e),
            _ => Ok(kept),
        }
    }

    async fn load(&self, image: &ImageRef) -> Result<Vec<u8>, NormalizationError> {
        match image.kind() {
            ImageRefKind::Inline => decode_data_url(image.as_str()),
            ImageRefKind::Remote => self.fetcher.fetch(image.as_str()).await,
            ImageRefKind::Unknown => Err(NormalizationError::LoadFailure(
                "unsupported image reference".to_string(),
            )),
        }
    }
}

/// Decode the payload of a base64 `data:` URL
///
/// # Errors
/// Returns `LoadFailure` for non-base64 or malformed data URLs.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>, NormalizationError> {
    let (header, payload) = data_url
        .trim()
        .split_once(',')
        .ok_or_else(|| NormalizationError::LoadFailure("data URL has no payload".to_string()))?;

    if !header.to_ascii_lowercase().ends_with(";base64") {
        return Err(NormalizationError::LoadFailure(
            "data URL is not base64 encoded".to_string(),
        ));
    }

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| NormalizationError::LoadFailure(format!("bad base64 payload: {e}")))
}

/// Normalize encoded image bytes synchronously
///
/// # Errors
/// - `LoadFailure` if the bytes are not a decodable image
/// - `RenderContextFailure` if the image is empty, exceeds `max_pixels`, or
///   cannot be encoded
pub fn normalize_bytes(bytes: &[u8], max_pixels: u64) -> Result<NormalizedImage, NormalizationError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| NormalizationError::LoadFailure(format!("decode: {e}")))?;

    let mut surface = acquire_surface(decoded.width(), decoded.height(), max_pixels)?;
    image::imageops::replace(&mut surface, &decoded.to_rgba8(), 0, 0);

    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(surface)
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| NormalizationError::RenderContextFailure(format!("encode: {e}")))?;

    Ok(NormalizedImage::from_data_url(format!(
        "{}{}",
        NormalizedImage::PREFIX,
        STANDARD.encode(buffer.into_inner())
    )))
}

fn acquire_surface(width: u32, height: u32, max_pixels: u64) -> Result<RgbaImage, NormalizationError> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels == 0 {
        return Err(NormalizationError::RenderContextFailure(format!(
            "cannot paint a {width}x{height} image"
        )));
    }
    if pixels > max_pixels {
        return Err(NormalizationError::RenderContextFailure(format!(
            "{width}x{height} exceeds the {max_pixels} pixel surface limit"
        )));
    }
    Ok(RgbaImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn data_url(bytes: &[u8], mime: &str) -> ImageRef {
        ImageRef::new(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
    }

    fn normalizer(fetcher: MockImageFetcher) -> ImageNormalizer {
        ImageNormalizer::with_fetcher(Arc::new(fetcher), &EngineConfig::default())
    }

    #[tokio::test]
    async fn inline_png_is_canonicalized() {
        let image = data_url(&png_bytes(4, 3, [10, 20, 30, 255]), "image/png");
        let normalized = normalizer(MockImageFetcher::new())
            .normalize(&image)
            .await
            .unwrap();

        assert!(normalized.as_data_url().starts_with(NormalizedImage::PREFIX));
        let bytes = decode_data_url(normalized.as_data_url()).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[tokio::test]
    async fn normalization_is_idempotent() {
        let n = normalizer(MockImageFetcher::new());
        let first = n
            .normalize(&data_url(&png_bytes(2, 2, [1, 2, 3, 255]), "image/png"))
            .await
            .unwrap();
        let second = n.normalize(&ImageRef::from(&first)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remote_images_go_through_fetcher() {
        let bytes = png_bytes(2, 2, [200, 0, 0, 255]);
        let mut fetcher = MockImageFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://cdn.example/slide.png")
            .times(1)
            .returning(move |_| Ok(bytes.clone()));

        let normalized = normalizer(fetcher)
            .normalize(&ImageRef::new("https://cdn.example/slide.png"))
            .await;
        assert!(normalized.is_ok());
    }

    #[tokio::test]
    async fn fetch_failure_is_load_failure() {
        let mut fetcher = MockImageFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Err(NormalizationError::LoadFailure("404".into())));

        let err = normalizer(fetcher)
            .normalize(&ImageRef::new("https://cdn.example/missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::LoadFailure(_)));
    }

    #[tokio::test]
    async fn undecodable_payload_is_load_failure() {
        let n = normalizer(MockImageFetcher::new());

        let garbage = data_url(b"not an image", "image/png");
        assert!(matches!(
            n.normalize(&garbage).await,
            Err(NormalizationError::LoadFailure(_))
        ));

        let not_base64 = ImageRef::new("data:image/png,rawbytes");
        assert!(matches!(
            n.normalize(&not_base64).await,
            Err(NormalizationError::LoadFailure(_))
        ));

        let unknown = ImageRef::new("file:///tmp/x.png");
        assert!(matches!(
            n.normalize(&unknown).await,
            Err(NormalizationError::LoadFailure(_))
        ));
    }

    #[tokio::test]
    async fn oversized_image_is_render_context_failure() {
        let config = EngineConfig::default().with_max_image_pixels(10);
        let n = ImageNormalizer::with_fetcher(Arc::new(MockImageFetcher::new()), &config);

        let err = n
            .normalize(&data_url(&png_bytes(4, 4, [0, 0, 0, 255]), "image/png"))
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::RenderContextFailure(_)));
    }

    #[tokio::test]
    async fn batch_failures_are_isolated() {
        let n = normalizer(MockImageFetcher::new());
        let images = vec![
            data_url(&png_bytes(1, 1, [0, 0, 0, 255]), "image/png"),
            data_url(b"broken", "image/png"),
            data_url(&png_bytes(1, 1, [9, 9, 9, 255]), "image/png"),
        ];

        let results = n.normalize_all(&images).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn failed_candidates_are_dropped_with_their_prompts() {
        let n = normalizer(MockImageFetcher::new());
        let kept = n
            .normalize_candidates(vec![
                (data_url(b"broken", "image/png"), "p0".to_string()),
                (data_url(&png_bytes(1, 1, [5, 5, 5, 255]), "image/png"), "p1".to_string()),
            ])
            .await
            .unwrap();

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].1, "p1");

        let none = n
            .normalize_candidates(vec![(data_url(b"broken", "image/png"), "p".to_string())])
            .await;
        assert!(matches!(none, Err(NormalizationError::LoadFailure(_))));
    }

    #[test]
    fn data_url_payload_whitespace_is_tolerated() {
        let encoded = STANDARD.encode(b"abc");
        let url = format!("data:text/plain;base64,{}\n{}", &encoded[..2], &encoded[2..]);
        assert_eq!(decode_data_url(&url).unwrap(), b"abc");
    }
}
