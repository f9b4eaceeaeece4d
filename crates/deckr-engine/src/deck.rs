//! Session deck store
//!
//! The slide collection is the only shared mutable resource. It is owned by
//! a single actor task; every mutation arrives as a [`DeckCommand`] through
//! the actor's channel, so writes are serialized no matter how many units
//! issue them concurrently.
//!
//! [`Deck`] holds the semantics and is usable without a runtime;
//! [`DeckHandle`] is the async front end.

use crate::error::DeckError;
use crate::types::{NormalizedImage, PendingPersonalization, Slide, SlideId, SlideSummary};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Result of a pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWrite {
    /// Bundle stored (or cleared)
    Applied,
    /// A newer write already landed; this one was ignored
    Superseded {
        /// Stamp of the newer write
        current: u64,
    },
}

/// In-memory slide collection
#[derive(Debug, Default)]
pub struct Deck {
    slides: Vec<Slide>,
    next_stamp: u64,
    /// Highest pending stamp accepted per slide
    high_water: HashMap<SlideId, u64>,
}

impl Deck {
    /// Create a deck from existing slides
    #[must_use]
    pub fn new(slides: Vec<Slide>) -> Self {
        let high_water = slides
            .iter()
            .filter_map(|s| s.pending().map(|p| (s.id().clone(), p.stamp)))
            .collect::<HashMap<_, _>>();
        let next_stamp = high_water.values().copied().max().unwrap_or(0);
        Self {
            slides,
            next_stamp,
            high_water,
        }
    }

    /// All slides in deck order
    #[inline]
    #[must_use]
    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    /// Look up one slide
    #[must_use]
    pub fn slide(&self, id: &SlideId) -> Option<&Slide> {
        self.slides.iter().find(|s| s.id() == id)
    }

    /// Issue a new write stamp
    pub fn reserve_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Attach, replace or clear a slide's pending bundle
    ///
    /// A `Some` write is ignored if a write with a newer stamp was already
    /// accepted for the slide. A `None` write only clears a bundle whose
    /// stamp is not newer than `stamp`; use [`Deck::discard`] to clear
    /// unconditionally.
    ///
    /// # Errors
    /// Returns `SlideNotFound` if the slide is gone.
    pub fn set_pending(
        &mut self,
        id: &SlideId,
        pending: Option<PendingPersonalization>,
        stamp: u64,
    ) -> Result<PendingWrite, DeckError> {
        let index = self.position(id)?;

        let current = if pending.is_some() {
            self.high_water.get(id).copied()
        } else {
            self.slides[index].pending().map(|p| p.stamp)
        };
        if let Some(current) = current.filter(|&current| current > stamp) {
            tracing::warn!(slide = %id, stamp, current, "ignoring superseded pending write");
            return Ok(PendingWrite::Superseded { current });
        }
        if pending.is_some() {
            self.high_water.insert(id.clone(), stamp);
        }

        self.slides[index].set_pending(pending);
        Ok(PendingWrite::Applied)
    }

    /// Append the chosen rendering and clear the pending bundle
    ///
    /// # Errors
    /// - `SlideNotFound` if the slide is gone
    /// - `NoPendingPersonalization` if nothing is pending
    /// - `StalePending` if the pending bundle is not the one reviewed
    pub fn confirm(
        &mut self,
        id: &SlideId,
        image: NormalizedImage,
        expected_stamp: u64,
    ) -> Result<(), DeckError> {
        let index = self.position(id)?;
        let slide = &mut self.slides[index];

        let found = slide
            .pending()
            .map(|p| p.stamp)
            .ok_or_else(|| DeckError::NoPendingPersonalization(id.clone()))?;
        if found != expected_stamp {
            return Err(DeckError::StalePending {
                slide: id.clone(),
                expected: expected_stamp,
                found,
            });
        }

        slide.push_rendering(image);
        slide.set_pending(None);
        Ok(())
    }

    /// Clear the pending bundle, leaving history untouched
    ///
    /// # Errors
    /// Returns `SlideNotFound` if the slide is gone.
    pub fn discard(&mut self, id: &SlideId) -> Result<(), DeckError> {
        let index = self.position(id)?;
        self.slides[index].set_pending(None);
        Ok(())
    }

    /// Insert a slide after `insert_after`, or at the end if the anchor is gone
    ///
    /// Returns the index the slide landed at.
    pub fn add_slide(&mut self, slide: Slide, insert_after: &SlideId) -> usize {
        if let Some(pending) = slide.pending() {
            self.high_water.insert(slide.id().clone(), pending.stamp);
        }

        let at = match self.position(insert_after) {
            Ok(index) => index + 1,
            Err(_) => {
                tracing::warn!(anchor = %insert_after, slide = %slide.id(), "anchor slide missing, appending");
                self.slides.len()
            }
        };
        self.slides.insert(at, slide);
        at
    }

    /// Remove a slide
    ///
    /// # Errors
    /// Returns `SlideNotFound` if the slide is gone.
    pub fn delete_slide(&mut self, id: &SlideId) -> Result<Slide, DeckError> {
        let index = self.position(id)?;
        self.high_water.remove(id);
        Ok(self.slides.remove(index))
    }

    /// Commit a new current rendering without review
    ///
    /// # Errors
    /// Returns `SlideNotFound` if the slide is gone.
    pub fn replace_slide_rendering(
        &mut self,
        id: &SlideId,
        image: NormalizedImage,
    ) -> Result<(), DeckError> {
        let index = self.position(id)?;
        self.slides[index].push_rendering(image);
        Ok(())
    }

    /// Drop the current rendering, keeping at least the first
    ///
    /// # Errors
    /// - `SlideNotFound` if the slide is gone
    /// - `NothingToUndo` if only the first rendering remains
    pub fn undo(&mut self, id: &SlideId) -> Result<NormalizedImage, DeckError> {
        let index = self.position(id)?;
        self.slides[index]
            .pop_rendering()
            .ok_or_else(|| DeckError::NothingToUndo(id.clone()))
    }

    fn position(&self, id: &SlideId) -> Result<usize, DeckError> {
        self.slides
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| DeckError::SlideNotFound(id.clone()))
    }
}

type Reply<T> = oneshot::Sender<T>;

/// Commands served by the deck actor
#[derive(Debug)]
pub enum DeckCommand {
    /// Copy of every slide
    Snapshot(Reply<Vec<Slide>>),
    /// Copy of one slide
    Slide(SlideId, Reply<Option<Slide>>),
    /// Issue a write stamp
    ReserveStamp(Reply<u64>),
    /// Set or clear pending
    SetPending {
        /// Target slide
        id: SlideId,
        /// Bundle, or `None` to clear
        pending: Option<PendingPersonalization>,
        /// Producer's stamp
        stamp: u64,
        /// Reply
        reply: Reply<Result<PendingWrite, DeckError>>,
    },
    /// Confirm a reviewed candidate
    Confirm {
        /// Target slide
        id: SlideId,
        /// Chosen rendering
        image: NormalizedImage,
        /// Stamp of the reviewed bundle
        expected_stamp: u64,
        /// Reply
        reply: Reply<Result<(), DeckError>>,
    },
    /// Discard pending
    Discard(SlideId, Reply<Result<(), DeckError>>),
    /// Insert a slide
    AddSlide {
        /// New slide
        slide: Slide,
        /// Anchor
        insert_after: SlideId,
        /// Reply with landing index
        reply: Reply<usize>,
    },
    /// Remove a slide
    DeleteSlide(SlideId, Reply<Result<Slide, DeckError>>),
    /// Append a rendering directly
    ReplaceRendering {
        /// Target slide
        id: SlideId,
        /// New rendering
        image: NormalizedImage,
        /// Reply
        reply: Reply<Result<(), DeckError>>,
    },
    /// Undo the last rendering
    Undo(SlideId, Reply<Result<NormalizedImage, DeckError>>),
    /// Stop the actor
    Shutdown,
}

/// Handle to the deck actor
#[derive(Debug, Clone)]
pub struct DeckHandle {
    sender: mpsc::Sender<DeckCommand>,
}

impl DeckHandle {
    /// Spawn the actor owning `slides`
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(slides: Vec<Slide>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(deck_task(Deck::new(slides), rx));
        Self { sender: tx }
    }

    /// Copy of every slide in deck order
    ///
    /// # Errors
    /// Returns `StoreClosed` if the actor is gone.
    pub async fn snapshot(&self) -> Result<Vec<Slide>, DeckError> {
        self.request(DeckCommand::Snapshot).await
    }

    /// Copy of one slide
    ///
    /// # Errors
    /// Returns `StoreClosed` if the actor is gone.
    pub async fn slide(&self, id: &SlideId) -> Result<Option<Slide>, DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::Slide(id, reply)).await
    }

    /// Copy of one slide, failing if absent
    ///
    /// # Errors
    /// Returns `SlideNotFound` or `StoreClosed`.
    pub async fn require_slide(&self, id: &SlideId) -> Result<Slide, DeckError> {
        self.slide(id)
            .await?
            .ok_or_else(|| DeckError::SlideNotFound(id.clone()))
    }

    /// Id/name pairs for plan generation
    ///
    /// # Errors
    /// Returns `StoreClosed` if the actor is gone.
    pub async fn summaries(&self) -> Result<Vec<SlideSummary>, DeckError> {
        Ok(self.snapshot().await?.iter().map(Slide::summary).collect())
    }

    /// Issue a write stamp
    ///
    /// # Errors
    /// Returns `StoreClosed` if the actor is gone.
    pub async fn reserve_stamp(&self) -> Result<u64, DeckError> {
        self.request(DeckCommand::ReserveStamp).await
    }

    /// Set or clear a slide's pending bundle
    ///
    /// # Errors
    /// Returns `SlideNotFound` or `StoreClosed`.
    pub async fn set_pending(
        &self,
        id: &SlideId,
        pending: Option<PendingPersonalization>,
        stamp: u64,
    ) -> Result<PendingWrite, DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::SetPending {
            id,
            pending,
            stamp,
            reply,
        })
        .await?
    }

    /// Append the chosen rendering and clear pending
    ///
    /// # Errors
    /// See [`Deck::confirm`]; also `StoreClosed`.
    pub async fn confirm(
        &self,
        id: &SlideId,
        image: NormalizedImage,
        expected_stamp: u64,
    ) -> Result<(), DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::Confirm {
            id,
            image,
            expected_stamp,
            reply,
        })
        .await?
    }

    /// Clear pending without touching history
    ///
    /// # Errors
    /// Returns `SlideNotFound` or `StoreClosed`.
    pub async fn discard(&self, id: &SlideId) -> Result<(), DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::Discard(id, reply)).await?
    }

    /// Insert a slide after an anchor
    ///
    /// # Errors
    /// Returns `StoreClosed` if the actor is gone.
    pub async fn add_slide(&self, slide: Slide, insert_after: &SlideId) -> Result<usize, DeckError> {
        let insert_after = insert_after.clone();
        self.request(|reply| DeckCommand::AddSlide {
            slide,
            insert_after,
            reply,
        })
        .await
    }

    /// Remove a slide
    ///
    /// # Errors
    /// Returns `SlideNotFound` or `StoreClosed`.
    pub async fn delete_slide(&self, id: &SlideId) -> Result<Slide, DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::DeleteSlide(id, reply)).await?
    }

    /// Append a rendering without review
    ///
    /// # Errors
    /// Returns `SlideNotFound` or `StoreClosed`.
    pub async fn replace_slide_rendering(
        &self,
        id: &SlideId,
        image: NormalizedImage,
    ) -> Result<(), DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::ReplaceRendering { id, image, reply })
            .await?
    }

    /// Undo the current rendering
    ///
    /// # Errors
    /// Returns `NothingToUndo`, `SlideNotFound` or `StoreClosed`.
    pub async fn undo(&self, id: &SlideId) -> Result<NormalizedImage, DeckError> {
        let id = id.clone();
        self.request(|reply| DeckCommand::Undo(id, reply)).await?
    }

    /// Stop the actor; later calls fail with `StoreClosed`
    pub async fn shutdown(&self) {
        let _ = self.sender.send(DeckCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> DeckCommand,
    ) -> Result<T, DeckError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| DeckError::StoreClosed)?;
        rx.await.map_err(|_| DeckError::StoreClosed)
    }
}

/// Deck actor loop
async fn deck_task(mut deck: Deck, mut rx: mpsc::Receiver<DeckCommand>) {
    while let Some(command) = rx.recv().await {
        // Reply send errors mean the caller went away; nothing to do.
        match command {
            DeckCommand::Snapshot(reply) => {
                let _ = reply.send(deck.slides().to_vec());
            }
            DeckCommand::Slide(id, reply) => {
                let _ = reply.send(deck.slide(&id).cloned());
            }
            DeckCommand::ReserveStamp(reply) => {
                let _ = reply.send(deck.reserve_stamp());
            }
            DeckCommand::SetPending {
                id,
                pending,
                stamp,
                reply,
            } => {
                let _ = reply.send(deck.set_pending(&id, pending, stamp));
            }
            DeckCommand::Confirm {
                id,
                image,
                expected_stamp,
                reply,
            } => {
                let _ = reply.send(deck.confirm(&id, image, expected_stamp));
            }
            DeckCommand::Discard(id, reply) => {
                let _ = reply.send(deck.discard(&id));
            }
            DeckCommand::AddSlide {
                slide,
                insert_after,
                reply,
            } => {
                let _ = reply.send(deck.add_slide(slide, &insert_after));
            }
            DeckCommand::DeleteSlide(id, reply) => {
                let _ = reply.send(deck.delete_slide(&id));
            }
            DeckCommand::ReplaceRendering { id, image, reply } => {
                let _ = reply.send(deck.replace_slide_rendering(&id, image));
            }
            DeckCommand::Undo(id, reply) => {
                let _ = reply.send(deck.undo(&id));
            }
            DeckCommand::Shutdown => break,
        }
    }
    tracing::debug!("deck store stopped");
}
