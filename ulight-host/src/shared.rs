//! Thread-safe handle to a bound instance.

use crate::abi::{LanguageId, Token};
use crate::error::Result;
use crate::invoke::Language;
use crate::loader::BoundInstance;
use crate::registry::LanguageEntry;
use parking_lot::Mutex;
use std::sync::Arc;

/// A cloneable handle that serializes calls to one [`BoundInstance`].
///
/// Calls from different threads queue on a mutex; each call still runs to
/// completion before the next one starts.
#[derive(Clone)]
pub struct SharedHighlighter {
    inner: Arc<Mutex<BoundInstance>>,
}

impl SharedHighlighter {
    /// Wrap a bound instance.
    pub fn new(instance: BoundInstance) -> Self {
        Self {
            inner: Arc::new(Mutex::new(instance)),
        }
    }

    /// See [`BoundInstance::highlight`].
    pub fn highlight(
        &self,
        source: impl AsRef<[u8]>,
        language: impl Into<Language>,
    ) -> Result<String> {
        self.inner.lock().highlight(source, language)
    }

    /// See [`BoundInstance::tokenize`].
    pub fn tokenize(
        &self,
        source: impl AsRef<[u8]>,
        language: impl Into<Language>,
    ) -> Result<Vec<Token>> {
        self.inner.lock().tokenize(source, language)
    }

    /// See [`BoundInstance::list_languages`].
    pub fn list_languages(&self) -> Result<Vec<LanguageEntry>> {
        self.inner.lock().list_languages()
    }

    /// See [`BoundInstance::resolve_language`].
    pub fn resolve_language(&self, name: &str) -> Result<Option<LanguageId>> {
        self.inner.lock().resolve_language(name)
    }

    /// See [`BoundInstance::reload`].
    pub fn reload(&self) -> Result<()> {
        self.inner.lock().reload()
    }

    /// Check if the underlying instance is poisoned.
    pub fn is_faulted(&self) -> bool {
        self.inner.lock().is_faulted()
    }

    /// Run `f` with exclusive access to the instance.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut BoundInstance) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl From<BoundInstance> for SharedHighlighter {
    fn from(instance: BoundInstance) -> Self {
        Self::new(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::thread;

    #[test]
    fn concurrent_callers_share_one_instance() {
        let shared = SharedHighlighter::new(testing::bound_instance());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let shared = shared.clone();
                thread::spawn(move || shared.highlight(format!("<{i}>"), "html"))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let html = handle.join().expect("thread panicked").unwrap();
            assert_eq!(html, format!("&lt;{i}&gt;"));
        }
        assert_eq!(shared.with_instance(|instance| instance.live_allocations()), 0);
    }

    #[test]
    fn registry_calls_pass_through() {
        let shared = SharedHighlighter::from(testing::bound_instance());
        assert_eq!(
            shared.resolve_language("js").unwrap(),
            Some(LanguageId::new(7))
        );
        assert_eq!(shared.list_languages().unwrap().len(), 5);
        assert!(!shared.is_faulted());
    }
}
