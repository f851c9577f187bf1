//! Running work on a specific logical processor.
//!
//! The caller's affinity is pinned to the target processor for the duration of the callback and
//! restored afterwards, also when the callback fails. Affinity changes are only legal at or below
//! the dispatch level; the [`Affinity`] implementation is responsible for enforcing that.

use crate::error::HypervisorError;

/// Control over which logical processor the current context executes on.
pub trait Affinity {
    /// Whatever is needed to put the previous affinity back.
    type Saved;

    fn processor_count(&self) -> u32;

    /// Moves the calling context onto `processor` and returns the affinity it had before.
    fn pin(&self, processor: u32) -> Self::Saved;

    fn restore(&self, saved: Self::Saved);
}

/// Restores the saved affinity when dropped.
pub struct AffinityGuard<'a, A: Affinity> {
    affinity: &'a A,
    saved: Option<A::Saved>,
}

impl<'a, A: Affinity> AffinityGuard<'a, A> {
    pub fn pin(affinity: &'a A, processor: u32) -> Result<Self, HypervisorError> {
        if processor >= affinity.processor_count() {
            return Err(HypervisorError::InvalidProcessor(processor));
        }

        Ok(Self { affinity, saved: Some(affinity.pin(processor)) })
    }
}

impl<A: Affinity> Drop for AffinityGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.affinity.restore(saved);
        }
    }
}

/// Runs `f` synchronously on `processor`.
pub fn run_on_processor<A: Affinity, R>(affinity: &A, processor: u32, f: impl FnOnce() -> R) -> Result<R, HypervisorError> {
    let _guard = AffinityGuard::pin(affinity, processor)?;
    log::trace!("Running on logical processor {}", processor);
    Ok(f())
}

/// Runs `f` on every logical processor in turn, stopping at the first failure.
pub fn run_on_all_processors<A: Affinity>(affinity: &A, mut f: impl FnMut(u32) -> Result<(), HypervisorError>) -> Result<(), HypervisorError> {
    for processor in 0..affinity.processor_count() {
        run_on_processor(affinity, processor, || f(processor))??;
    }

    Ok(())
}
