//! Process registry
//!
//! Maps a resource kind to the one shared handle of that kind. Managers only
//! consult it when [`crate::RetentionPolicy::cache_handle_across_reloads`] is
//! set, so a manager rebuilt during a development reload picks up the handle
//! created by its predecessor instead of opening another connection.
//!
//! Initialization order: the entry point creates (or fetches
//! [`ProcessRegistry::global`]) the registry first and passes it to every
//! manager it constructs.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::error::RegistryError;

type SharedHandle = Arc<dyn Any + Send + Sync>;

static GLOBAL: Lazy<Arc<ProcessRegistry>> = Lazy::new(|| Arc::new(ProcessRegistry::new()));

/// Resource kind name to shared handle
#[derive(Default)]
pub struct ProcessRegistry {
    handles: DashMap<&'static str, SharedHandle>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&'static str> = self.handles.iter().map(|e| *e.key()).collect();
        f.debug_struct("ProcessRegistry").field("kinds", &kinds).finish()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process
    pub fn global() -> Arc<ProcessRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Look up the handle registered for `kind`
    ///
    /// Returns `None` when nothing is registered or the stored handle is of a
    /// different type.
    pub fn get<T>(&self, kind: &'static str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.handles.get(kind)?;
        Arc::clone(entry.value()).downcast::<T>().ok()
    }

    /// Return the handle for `kind`, creating and storing it when absent
    ///
    /// The entry stays locked while `init` runs, so concurrent callers never
    /// create two handles for the same kind. A kind already registered with
    /// another handle type is a [`RegistryError::KindMismatch`].
    pub fn get_or_try_insert_with<T, E, F>(&self, kind: &'static str, init: F) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        E: From<RegistryError>,
        F: FnOnce() -> Result<Arc<T>, E>,
    {
        let entry = self.handles.entry(kind).or_try_insert_with(|| {
            debug!(kind, "Registering process-wide handle");
            init().map(|handle| handle as SharedHandle)
        })?;
        let shared = Arc::clone(entry.value());
        drop(entry);

        shared.downcast::<T>().map_err(|_| {
            E::from(RegistryError::KindMismatch {
                kind,
                expected: std::any::type_name::<T>(),
            })
        })
    }

    /// Forget the handle for `kind`; the next lookup creates a fresh one
    pub fn remove(&self, kind: &'static str) -> bool {
        self.handles.remove(kind).is_some()
    }

    pub fn contains(&self, kind: &'static str) -> bool {
        self.handles.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
