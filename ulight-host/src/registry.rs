//! Decoding the guest's language tables.
//!
//! The guest exposes three statically allocated tables through exported
//! globals whose values are addresses:
//!
//! - `ulight_lang_list`: an array of `{name, name_length, id}` entries,
//!   sorted by name, with one entry per alias,
//! - `ulight_lang_list_length`: a word holding the number of entries,
//! - `ulight_lang_display_names`: an array of `{address, length}` string
//!   views indexed by language id.

use crate::abi::{DISPLAY_NAME_ENTRY_SIZE, LANG_ENTRY_SIZE, LanguageId, WORD_SIZE, exports};
use crate::error::{HighlightError, Result};
use crate::invoke::{Acquisitions, settle};
use crate::loader::{BoundInstance, Parts};
use crate::marshal;
use serde::Serialize;
use std::collections::BTreeMap;
use wasmtime::TypedFunc;

/// A selectable language as listed by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageEntry {
    /// Short name, e.g. `cpp`.
    pub name: String,
    /// Human-readable name, e.g. `C++`. Empty if the guest has none.
    pub display_name: String,
    /// Numeric id passed to the highlighter.
    pub id: LanguageId,
}

/// One undecoded list entry.
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    name_address: u32,
    name_length: u32,
    id: LanguageId,
}

/// Addresses of the three tables.
struct RegistryTables {
    list: u32,
    list_length: u32,
    display_names: u32,
}

impl RegistryTables {
    fn locate(parts: &mut Parts<'_>) -> Result<Self> {
        Ok(Self {
            list: parts.global_address(exports::LANG_LIST)?,
            list_length: parts.global_address(exports::LANG_LIST_LENGTH)?,
            display_names: parts.global_address(exports::LANG_DISPLAY_NAMES)?,
        })
    }

    fn count(&self, parts: &Parts<'_>) -> Result<u32> {
        parts.memory.read_word(&*parts.store, self.list_length)
    }

    fn raw_entries(&self, parts: &Parts<'_>) -> Result<Vec<RawEntry>> {
        let count = self.count(parts)?;
        if count.checked_mul(LANG_ENTRY_SIZE).is_none() {
            return Err(HighlightError::OutOfBounds {
                address: self.list,
                length: u32::MAX,
                memory_size: parts.memory.size(&*parts.store),
            });
        }

        parts.memory.with_words(&*parts.store, |words| {
            let first = self.list / WORD_SIZE;
            (0..count)
                .map(|i| {
                    let at = first + i * (LANG_ENTRY_SIZE / WORD_SIZE);
                    let entry = (words.get(at), words.get(at + 1), words.get(at + 2));
                    match entry {
                        (Some(name_address), Some(name_length), Some(id)) => Ok(RawEntry {
                            name_address,
                            name_length,
                            id: LanguageId::new(id),
                        }),
                        _ => Err(HighlightError::OutOfBounds {
                            address: at * WORD_SIZE,
                            length: LANG_ENTRY_SIZE,
                            memory_size: words.len() * WORD_SIZE as usize,
                        }),
                    }
                })
                .collect()
        })
    }

    fn display_name(&self, parts: &Parts<'_>, id: LanguageId) -> Result<Option<String>> {
        if id.is_none() {
            return Ok(None);
        }
        let entry = id
            .get()
            .checked_mul(DISPLAY_NAME_ENTRY_SIZE)
            .and_then(|offset| self.display_names.checked_add(offset))
            .ok_or(HighlightError::OutOfBounds {
                address: self.display_names,
                length: DISPLAY_NAME_ENTRY_SIZE,
                memory_size: parts.memory.size(&*parts.store),
            })?;
        let address = parts.memory.read_word(&*parts.store, entry)?;
        let length = parts.memory.read_word(&*parts.store, entry + WORD_SIZE)?;
        if address == 0 || length == 0 {
            return Ok(None);
        }
        marshal::from_guest(parts.memory, &*parts.store, address, length).map(Some)
    }
}

/// Call a `(const char*, size_t) -> ulight_lang` lookup with `text`.
pub(crate) fn lookup(
    parts: &mut Parts<'_>,
    func: &TypedFunc<(u32, u32), u32>,
    text: &str,
) -> Result<Option<LanguageId>> {
    let mut acquired = Acquisitions::default();
    let outcome = call_lookup(parts, &mut acquired, func, text);
    settle(parts, acquired, outcome)
}

fn call_lookup(
    parts: &mut Parts<'_>,
    acquired: &mut Acquisitions,
    func: &TypedFunc<(u32, u32), u32>,
    text: &str,
) -> Result<Option<LanguageId>> {
    let name = acquired
        .source
        .insert(marshal::to_guest(parts.allocator, parts.store, text)?);
    let raw = func
        .call(&mut *parts.store, (name.address(), name.size()))
        .map_err(HighlightError::fault)?;
    Ok(LanguageId::known(raw))
}

/// Resolve a short language name through `ulight_get_lang`.
pub(crate) fn resolve(parts: &mut Parts<'_>, name: &str) -> Result<Option<LanguageId>> {
    let get_lang = parts.exports.get_lang.clone();
    lookup(parts, &get_lang, name)
}

impl BoundInstance {
    /// List every language the guest knows, in guest order.
    ///
    /// Aliases appear as separate entries sharing an id.
    pub fn list_languages(&mut self) -> Result<Vec<LanguageEntry>> {
        self.run(|parts| {
            let tables = RegistryTables::locate(parts)?;
            let mut display_names = BTreeMap::new();
            let mut languages = Vec::new();

            for raw in tables.raw_entries(parts)? {
                let name =
                    marshal::from_guest(parts.memory, &*parts.store, raw.name_address, raw.name_length)?;
                let display_name = match display_names.get(&raw.id) {
                    Some(known) => String::clone(known),
                    None => {
                        let decoded = tables.display_name(parts, raw.id)?.unwrap_or_default();
                        display_names.insert(raw.id, decoded.clone());
                        decoded
                    }
                };
                languages.push(LanguageEntry {
                    name,
                    display_name,
                    id: raw.id,
                });
            }
            Ok(languages)
        })
    }

    /// Number of entries in the language list, aliases included.
    pub fn language_count(&mut self) -> Result<u32> {
        self.run(|parts| RegistryTables::locate(parts)?.count(parts))
    }

    /// Resolve a short name such as `cpp` or `javascript` to an id.
    ///
    /// Returns `None` when the guest does not know the name.
    pub fn resolve_language(&mut self, name: &str) -> Result<Option<LanguageId>> {
        self.run(|parts| resolve(parts, name))
    }

    /// Human-readable name of a language id.
    ///
    /// Returns `None` for the sentinel, for ids the guest does not list and
    /// for languages without a display name.
    pub fn display_name(&mut self, id: LanguageId) -> Result<Option<String>> {
        self.run(|parts| {
            let tables = RegistryTables::locate(parts)?;
            let listed = tables.raw_entries(parts)?.iter().any(|raw| raw.id == id);
            if !listed {
                return Ok(None);
            }
            tables.display_name(parts, id)
        })
    }

    /// Human-readable name of a language given by short name.
    pub fn display_name_of(&mut self, name: &str) -> Result<Option<String>> {
        match self.resolve_language(name)? {
            Some(id) => self.display_name(id),
            None => Ok(None),
        }
    }

    /// Display names of every listed language, keyed by id.
    pub fn display_names(&mut self) -> Result<BTreeMap<LanguageId, String>> {
        self.run(|parts| {
            let tables = RegistryTables::locate(parts)?;
            let mut names = BTreeMap::new();
            for raw in tables.raw_entries(parts)? {
                if names.contains_key(&raw.id) {
                    continue;
                }
                if let Some(name) = tables.display_name(parts, raw.id)? {
                    names.insert(raw.id, name);
                }
            }
            Ok(names)
        })
    }

    /// Detect the language of a file from its path.
    ///
    /// Uses the guest's `ulight_lang_from_path` when exported and otherwise
    /// resolves the text after the last `.` as a short name.
    pub fn language_for_path(&mut self, path: &str) -> Result<Option<LanguageId>> {
        self.run(|parts| match parts.exports.lang_from_path.clone() {
            Some(lang_from_path) => lookup(parts, &lang_from_path, path),
            None => match extension(path) {
                Some(extension) => resolve(parts, extension),
                None => Ok(None),
            },
        })
    }
}

/// Text after the last `.` of `path`, if nonempty.
fn extension(path: &str) -> Option<&str> {
    path.rsplit_once('.')
        .map(|(_, extension)| extension)
        .filter(|extension| !extension.is_empty())
}
