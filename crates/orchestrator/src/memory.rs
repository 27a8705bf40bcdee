//! Opaque per-thread state handed to each run's adapter.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Handle to a thread's memory slot.
///
/// The slot holds whatever type the adapter chooses; reading it as another
/// type resets it to that type's default. Clones share the same slot.
#[derive(Clone, Default)]
pub struct ThreadMemory {
    slot: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl ThreadMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the stored `T`, creating it first if needed.
    pub async fn with<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if !matches!(slot.as_ref(), Some(value) if value.is::<T>()) {
            *slot = Some(Box::new(T::default()));
        }

        match slot.as_mut().and_then(|value| value.downcast_mut::<T>()) {
            Some(value) => f(value),
            None => f(&mut T::default()),
        }
    }

    /// Copy of the stored `T`, if the slot currently holds one.
    pub async fn get<T>(&self) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.slot.lock().await.is_none()
    }

    /// Destroy the stored state.
    pub async fn clear(&self) {
        self.slot.lock().await.take();
    }
}

impl std::fmt::Debug for ThreadMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadMemory").finish_non_exhaustive()
    }
}
