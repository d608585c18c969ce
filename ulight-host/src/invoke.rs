//! Driving one highlighting request end to end.
//!
//! Every request follows the same sequence: open the output accumulator,
//! acquire the source buffer, the token buffer, the text buffer and the
//! request record, call the guest, then release everything in reverse
//! order. Release happens on every path except a guest fault, after which
//! the instance is poisoned and no further guest code may run.

use crate::abi::{LanguageId, TOKEN_ALIGN, Token};
use crate::alloc::Allocation;
use crate::error::{HighlightError, Result};
use crate::host::StreamedOutput;
use crate::loader::{BoundInstance, Parts};
use crate::marshal;
use crate::registry;
use crate::state::{Request, StateRecord};
use std::fmt;
use wasmtime::TypedFunc;

/// Language selector accepted by [`BoundInstance::highlight`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Language {
    /// A numeric id, passed through unchanged.
    Id(LanguageId),
    /// A short name such as `cpp`, resolved through the guest.
    Name(String),
}

impl From<LanguageId> for Language {
    fn from(id: LanguageId) -> Self {
        Self::Id(id)
    }
}

impl From<u32> for Language {
    fn from(id: u32) -> Self {
        Self::Id(LanguageId::new(id))
    }
}

impl From<&str> for Language {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Language {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for Language {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Which guest entry point a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Html,
    Tokens,
}

/// Guest resources held by one request.
#[derive(Default)]
pub(crate) struct Acquisitions {
    pub(crate) source: Option<Allocation>,
    pub(crate) token_buffer: Option<Allocation>,
    pub(crate) text_buffer: Option<Allocation>,
    pub(crate) state: Option<StateRecord>,
}

impl Acquisitions {
    /// Release everything, most recent first.
    ///
    /// Stops at the first fault since the guest can no longer be called.
    fn release(self, parts: &mut Parts<'_>) -> Result<()> {
        let mut first_error = None;

        if let Some(state) = self.state {
            let fns = parts.exports.state_fns.as_ref();
            if let Err(err) = state.release(parts.store, parts.allocator, fns) {
                if err.is_fatal() {
                    return Err(err);
                }
                first_error = Some(err);
            }
        }

        for allocation in [self.text_buffer, self.token_buffer, self.source]
            .into_iter()
            .flatten()
        {
            if let Err(err) = parts.allocator.free(parts.store, allocation) {
                if err.is_fatal() {
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Release `acquired` and combine the outcome with any release failure.
///
/// A release failure is returned only when the request itself succeeded;
/// otherwise it is logged and the primary error wins.
pub(crate) fn settle<T>(
    parts: &mut Parts<'_>,
    acquired: Acquisitions,
    outcome: Result<T>,
) -> Result<T> {
    if let Err(err) = &outcome {
        if err.is_fatal() {
            tracing::debug!("Skipping release of guest resources after a fault");
            return outcome;
        }
    }

    let released = acquired.release(parts);
    if let Err(HighlightError::GuestFault { cause }) = &released {
        parts.poison(cause);
    }

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(release),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release)) => {
            tracing::error!(error = %release, primary = %err, "Failed to release guest resources");
            Err(err)
        }
    }
}

impl BoundInstance {
    /// Highlight `source` as HTML.
    ///
    /// `language` is a numeric id or a short name. The source bytes are
    /// passed to the guest unmodified; the guest rejects malformed UTF-8.
    pub fn highlight(
        &mut self,
        source: impl AsRef<[u8]>,
        language: impl Into<Language>,
    ) -> Result<String> {
        let language = language.into();
        let source = source.as_ref();
        self.run(|parts| {
            let id = resolve(parts, &language)?;
            let output = invoke(parts, source, id, Mode::Html)?;
            let chunks = output.chunks();
            let html = output.into_text()?;
            tracing::debug!(
                language = %language,
                source_len = source.len(),
                html_len = html.len(),
                chunks,
                "Highlighted source"
            );
            Ok(html)
        })
    }

    /// Split `source` into highlighted spans.
    pub fn tokenize(
        &mut self,
        source: impl AsRef<[u8]>,
        language: impl Into<Language>,
    ) -> Result<Vec<Token>> {
        let language = language.into();
        let source = source.as_ref();
        self.run(|parts| {
            let id = resolve(parts, &language)?;
            let output = invoke(parts, source, id, Mode::Tokens)?;
            let chunks = output.chunks();
            let tokens = output.into_tokens()?;
            tracing::debug!(
                language = %language,
                source_len = source.len(),
                tokens = tokens.len(),
                chunks,
                "Tokenized source"
            );
            Ok(tokens)
        })
    }
}

// Ids go to the guest unchanged; it rejects ones it does not know.
fn resolve(parts: &mut Parts<'_>, language: &Language) -> Result<LanguageId> {
    match language {
        Language::Id(id) => Ok(*id),
        Language::Name(name) => {
            registry::resolve(parts, name)?.ok_or_else(|| HighlightError::UnknownLanguage {
                name: name.clone(),
            })
        }
    }
}

fn invoke(
    parts: &mut Parts<'_>,
    source: &[u8],
    language: LanguageId,
    mode: Mode,
) -> Result<StreamedOutput> {
    let entry = match mode {
        Mode::Html => parts.exports.source_to_html.clone(),
        Mode::Tokens => parts.exports.source_to_tokens.clone().ok_or_else(|| {
            HighlightError::MissingExport {
                name: crate::abi::exports::SOURCE_TO_TOKENS.to_string(),
                cause: "guest does not support tokenization".to_string(),
            }
        })?,
    };

    parts.store.data_mut().begin_output()?;

    let mut acquired = Acquisitions::default();
    let outcome = submit(parts, &mut acquired, &entry, source, language, mode);
    let output = parts.store.data_mut().finish_output().unwrap_or_default();

    settle(parts, acquired, outcome).map(|()| output)
}

fn submit(
    parts: &mut Parts<'_>,
    acquired: &mut Acquisitions,
    entry: &TypedFunc<u32, u32>,
    source: &[u8],
    language: LanguageId,
    mode: Mode,
) -> Result<()> {
    let token_buffer_size = parts.config.token_buffer_size;
    let text_buffer_size = parts.config.text_buffer_size;

    let source = acquired
        .source
        .insert(marshal::bytes_to_guest(parts.allocator, parts.store, source)?);
    let token_buffer = acquired.token_buffer.insert(parts.allocator.allocate(
        parts.store,
        token_buffer_size,
        TOKEN_ALIGN,
    )?);
    let text_buffer = match mode {
        Mode::Html => Some(
            &*acquired
                .text_buffer
                .insert(parts.allocator.allocate(parts.store, text_buffer_size, 1)?),
        ),
        Mode::Tokens => None,
    };
    let state = acquired.state.insert(StateRecord::create(
        parts.store,
        parts.allocator,
        parts.exports.state_fns.as_ref(),
    )?);

    let request = Request {
        source,
        language,
        token_buffer,
        flush_tokens: (mode == Mode::Tokens).then_some(parts.callbacks.flush_tokens),
        text_buffer,
        flush_text: (mode == Mode::Html).then_some(parts.callbacks.flush_text),
    };
    state.write(parts.store, parts.memory, &request)?;

    let status = entry
        .call(&mut *parts.store, state.address())
        .map_err(HighlightError::fault)?;
    if status != 0 {
        return Err(state.guest_error(&*parts.store, parts.memory, status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::GuestStatus;
    use crate::testing;

    #[test]
    fn language_conversions() {
        assert_eq!(Language::from(7), Language::Id(LanguageId::new(7)));
        assert_eq!(Language::from("cpp"), Language::Name("cpp".to_string()));
        let owned = String::from("html");
        assert_eq!(Language::from(&owned).to_string(), "html");
        assert_eq!(Language::from(LanguageId::new(4)).to_string(), "4");
    }

    #[test]
    fn highlight_streams_escaped_html() {
        let mut instance = testing::bound_instance();
        let html = instance.highlight("<b>x</b>", "html").unwrap();
        assert_eq!(html, "&lt;b&gt;x&lt;/b&gt;");
        assert_eq!(instance.live_allocations(), 0);
        assert_eq!(testing::outstanding(&mut instance), 0);
    }

    #[test]
    fn numeric_ids_skip_resolution() {
        let mut instance = testing::bound_instance();
        assert_eq!(instance.highlight("a&b", testing::CPP).unwrap(), "a&amp;b");
        assert_eq!(instance.highlight("a&b", testing::JAVASCRIPT).unwrap(), "a&amp;b");

        let err = instance.highlight("a", 0u32).unwrap_err();
        assert!(matches!(err, HighlightError::GuestReportedError { code: 2, .. }));
        assert_eq!(err.guest_status(), Some(GuestStatus::BadLang));
        assert_eq!(instance.live_allocations(), 0);
        assert_eq!(testing::outstanding(&mut instance), 0);
    }

    #[test]
    fn guest_status_becomes_error() {
        let mut instance = testing::bound_instance();
        let err = instance.highlight("x", 5u32).unwrap_err();
        match err {
            HighlightError::GuestReportedError { code, ref message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "The given language (numeric value) is invalid.");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!instance.is_faulted());
        assert_eq!(instance.live_allocations(), 0);
        assert_eq!(testing::outstanding(&mut instance), 0);
        assert_eq!(testing::outstanding_bytes(&mut instance), 0);
    }

    #[test]
    fn tokenize_reports_spans() {
        let mut instance = testing::bound_instance();
        let tokens = instance.tokenize("int main", "cpp").unwrap();
        let spans: Vec<_> = tokens.iter().map(|t| (t.begin, t.length)).collect();
        assert_eq!(spans, [(0, 3), (4, 4)]);
        assert_eq!(instance.live_allocations(), 0);
    }

    #[test]
    fn empty_source_highlights_to_empty_output() {
        let mut instance = testing::bound_instance();
        assert_eq!(instance.highlight("", "cpp").unwrap(), "");
        assert!(instance.tokenize("", "cpp").unwrap().is_empty());
        assert_eq!(instance.live_allocations(), 0);
    }

    #[test]
    fn trap_poisons_instance() {
        let mut instance = testing::bound_instance();
        let err = instance.highlight("x", testing::TRAPPING).unwrap_err();
        assert!(matches!(err, HighlightError::GuestFault { .. }));
        assert!(instance.is_faulted());
        assert!(instance.tokenize("x", testing::CPP).unwrap_err().is_fatal());
    }
}
