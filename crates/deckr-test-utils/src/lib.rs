//! Testing utilities for the Deckr workspace
//!
//! Image fixtures, deck builders, a scripted generative backend and a
//! static planner.

#![allow(missing_docs)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use deckr_engine::normalizer::{decode_data_url, normalize_bytes};
use deckr_engine::{
    BackendError, CreationExtras, EditSession, EngineConfig, GenerativeBackend, Generation,
    ImageRef, NormalizedImage, PlanGenerator, Slide, SlideId, SlideSummary,
};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn png_data_url(rgba: [u8; 4]) -> ImageRef {
    ImageRef::new(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(solid_png(4, 3, rgba))
    ))
}

/// Inline PNG reference whose payload does not decode to an image
pub fn garbage_data_url() -> ImageRef {
    ImageRef::new("data:image/png;base64,AAAA")
}

pub fn normalized(rgba: [u8; 4]) -> NormalizedImage {
    normalize_bytes(&solid_png(4, 3, rgba), u64::MAX).unwrap()
}

/// Normalized form of an inline reference, as the engine would produce it
pub fn normalize_ref(image: &ImageRef) -> NormalizedImage {
    normalize_bytes(&decode_data_url(image.as_str()).unwrap(), u64::MAX).unwrap()
}

// ---------------------------------------------------------------------------
// Decks
// ---------------------------------------------------------------------------

pub fn slide(id: &str, shade: u8) -> Slide {
    Slide::new(SlideId::new(id), format!("Slide {id}"), normalized([shade, shade, shade, 255]))
}

/// Slides named `Slide <id>` with distinct grey renderings
pub fn deck(ids: &[&str]) -> Vec<Slide> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| slide(id, (20 + (i * 30) % 230) as u8))
        .collect()
}

pub fn session(
    config: &EngineConfig,
    slides: Vec<Slide>,
    planner: Arc<dyn PlanGenerator>,
    backend: Arc<dyn GenerativeBackend>,
) -> EditSession {
    EditSession::new(config, slides, planner, backend).unwrap()
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Edit,
    Create,
    Variations,
    Remake,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub prompt: String,
    pub base: NormalizedImage,
    pub references: Vec<NormalizedImage>,
    pub model: Option<String>,
    pub deep_mode: bool,
    pub returned: Vec<ImageRef>,
}

/// Generative backend answering from a script
///
/// Every successful call returns `candidates` distinct solid-color images.
#[derive(Debug)]
pub struct ScriptedBackend {
    candidates: usize,
    fail_prompts: Vec<String>,
    fail_bases: Vec<NormalizedImage>,
    hang_prompts: Vec<String>,
    /// Prompt needle and candidate index (`None` for every candidate)
    garbage: Vec<(String, Option<usize>)>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new(candidates: usize) -> Self {
        Self {
            candidates,
            fail_prompts: Vec::new(),
            fail_bases: Vec::new(),
            hang_prompts: Vec::new(),
            garbage: Vec::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail calls whose prompt contains `needle`
    pub fn failing_on_prompt(mut self, needle: &str) -> Self {
        self.fail_prompts.push(needle.to_string());
        self
    }

    /// Fail calls whose base image is `base`
    pub fn failing_on_base(mut self, base: NormalizedImage) -> Self {
        self.fail_bases.push(base);
        self
    }

    /// Never answer calls whose prompt contains `needle`
    pub fn hanging_on_prompt(mut self, needle: &str) -> Self {
        self.hang_prompts.push(needle.to_string());
        self
    }

    /// Answer calls whose prompt contains `needle` with undecodable images
    pub fn returning_garbage_on_prompt(mut self, needle: &str) -> Self {
        self.garbage.push((needle.to_string(), None));
        self
    }

    /// Make candidate `index` undecodable for calls whose prompt contains `needle`
    pub fn garbling_candidate(mut self, needle: &str, index: usize) -> Self {
        self.garbage.push((needle.to_string(), Some(index)));
        self
    }

    fn is_garbage(&self, prompt: &str, index: usize) -> bool {
        self.garbage
            .iter()
            .any(|(n, at)| prompt.contains(n.as_str()) && at.map_or(true, |at| at == index))
    }

    /// Hold every call until `gate` hands out a permit
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    async fn answer(
        &self,
        kind: CallKind,
        prompt: &str,
        base: &NormalizedImage,
        references: &[NormalizedImage],
        model: Option<&str>,
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.hang_prompts.iter().any(|n| prompt.contains(n.as_str())) {
            std::future::pending::<()>().await;
        }

        let returned = {
            let mut calls = self.calls.lock();
            let call_no = calls.len();
            let failed = self.fail_prompts.iter().any(|n| prompt.contains(n.as_str()))
                || self.fail_bases.contains(base);
            let returned: Vec<ImageRef> = if failed {
                Vec::new()
            } else {
                (0..self.candidates)
                    .map(|index| {
                        if self.is_garbage(prompt, index) {
                            garbage_data_url()
                        } else {
                            png_data_url(candidate_color(call_no, index))
                        }
                    })
                    .collect()
            };
            calls.push(Call {
                kind,
                prompt: prompt.to_string(),
                base: base.clone(),
                references: references.to_vec(),
                model: model.map(str::to_string),
                deep_mode,
                returned: returned.clone(),
            });
            if failed {
                return Err(BackendError::Failed(format!("scripted failure for '{prompt}'")));
            }
            returned
        };
        Ok(returned)
    }
}

fn candidate_color(call_no: usize, index: usize) -> [u8; 4] {
    [
        (call_no.wrapping_mul(37) % 256) as u8,
        (index.wrapping_mul(61) % 256) as u8,
        200,
        255,
    ]
}

fn with_prompts(images: Vec<ImageRef>, prompt: &str) -> Generation {
    let prompts = (0..images.len())
        .map(|i| format!("{prompt} (variation {})", i + 1))
        .collect();
    Generation::new(images, prompts)
}

#[async_trait::async_trait]
impl GenerativeBackend for ScriptedBackend {
    async fn edit_slide(
        &self,
        base: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
    ) -> Result<Generation, BackendError> {
        let images = self
            .answer(CallKind::Edit, prompt, base, &[], None, deep_mode)
            .await?;
        Ok(with_prompts(images, prompt))
    }

    async fn create_slide(
        &self,
        reference: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
        _extras: &CreationExtras,
    ) -> Result<Generation, BackendError> {
        let images = self
            .answer(CallKind::Create, prompt, reference, &[], None, deep_mode)
            .await?;
        Ok(with_prompts(images, prompt))
    }

    async fn generate_variations(
        &self,
        model: &str,
        prompt: &str,
        base: &NormalizedImage,
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError> {
        self.answer(CallKind::Variations, prompt, base, &[], Some(model), deep_mode)
            .await
    }

    async fn remake_with_reference(
        &self,
        prompt: &str,
        base: &NormalizedImage,
        references: &[NormalizedImage],
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError> {
        self.answer(CallKind::Remake, prompt, base, references, None, deep_mode)
            .await
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Planner that always returns the same plan
#[derive(Debug)]
pub struct StaticPlanner {
    plan: serde_json::Value,
    requests: Mutex<Vec<(String, Vec<SlideSummary>)>>,
}

impl StaticPlanner {
    pub fn new(plan: serde_json::Value) -> Self {
        Self {
            plan,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, Vec<SlideSummary>)> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl PlanGenerator for StaticPlanner {
    async fn generate_plan(
        &self,
        request: &str,
        slides: &[SlideSummary],
    ) -> Result<serde_json::Value, BackendError> {
        self.requests
            .lock()
            .push((request.to_string(), slides.to_vec()));
        Ok(self.plan.clone())
    }
}

pub fn no_plan() -> Arc<StaticPlanner> {
    Arc::new(StaticPlanner::new(serde_json::json!({ "tasks": [] })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_decks_get_distinct_renderings() {
        let slides = deck(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l"]);
        assert_eq!(slides.len(), 12);
        for (i, left) in slides.iter().enumerate() {
            for right in &slides[i + 1..] {
                assert_ne!(left.original(), right.original());
            }
        }
    }

    #[tokio::test]
    async fn garbage_candidates_are_scripted_per_index() {
        let backend = ScriptedBackend::new(3).garbling_candidate("tidy", 1);
        let base = normalized([1, 2, 3, 255]);

        let images = backend
            .generate_variations("m", "tidy", &base, false)
            .await
            .unwrap();
        assert_eq!(images[1], garbage_data_url());
        assert_ne!(images[0], garbage_data_url());
        assert_ne!(images[2], garbage_data_url());
    }
}
