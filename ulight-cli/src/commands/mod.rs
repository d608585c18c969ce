//! CLI command implementations.

pub mod highlight;
pub mod languages;
pub mod tokens;
pub mod version;

use anyhow::{Context, Result, bail};
use std::io::Read;
use std::path::Path;
use ulight_host::{BindingConfig, BoundInstance, Language, load_file};

/// Load the highlighter module with environment-derived limits.
pub fn open(module: &Path) -> Result<BoundInstance> {
    let config = BindingConfig::from_env().context("Invalid binding configuration")?;
    load_file(module, config)
        .with_context(|| format!("Failed to load highlighter module {}", module.display()))
}

/// Read source bytes from `input`, or stdin when it is absent or `-`.
pub fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    match input {
        Some(path) if path != Path::new("-") => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        _ => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .context("Failed to read stdin")?;
            Ok(buffer)
        }
    }
}

/// Pick the language from `--lang`, or infer it from the input path.
///
/// A numeric `--lang` is taken as a raw id.
pub fn select_language(
    instance: &mut BoundInstance,
    lang: Option<&str>,
    input: Option<&Path>,
) -> Result<Language> {
    if let Some(lang) = lang {
        return Ok(match lang.parse::<u32>() {
            Ok(id) => Language::from(id),
            Err(_) => Language::from(lang),
        });
    }

    let Some(path) = input.filter(|p| *p != Path::new("-")) else {
        bail!("Cannot infer the language of stdin; pass --lang");
    };
    let path_str = path.to_string_lossy();
    match instance.language_for_path(&path_str)? {
        Some(id) => {
            tracing::debug!(path = %path_str, id = %id, "Inferred language from path");
            Ok(Language::from(id))
        }
        None => bail!("Cannot infer the language of {}; pass --lang", path.display()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Write the guest double to a temporary `.wasm` file.
    pub fn guest_module() -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".wasm")
            .tempfile()
            .expect("Failed to create temp file");
        file.write_all(&ulight_host::testing::guest_wasm())
            .expect("Failed to write module");
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::guest_module;
    use ulight_host::LanguageId;

    #[test]
    fn numeric_lang_is_an_id() {
        let module = guest_module();
        let mut instance = open(module.path()).expect("Failed to open");
        let language = select_language(&mut instance, Some("7"), None).unwrap();
        assert!(matches!(language, Language::Id(id) if id == LanguageId::new(7)));
    }

    #[test]
    fn lang_is_inferred_from_path() {
        let module = guest_module();
        let mut instance = open(module.path()).expect("Failed to open");
        let language =
            select_language(&mut instance, None, Some(Path::new("src/page.html"))).unwrap();
        assert!(matches!(language, Language::Id(id) if id == ulight_host::testing::HTML));
    }

    #[test]
    fn stdin_requires_lang() {
        let module = guest_module();
        let mut instance = open(module.path()).expect("Failed to open");
        assert!(select_language(&mut instance, None, None).is_err());
        assert!(select_language(&mut instance, None, Some(Path::new("-"))).is_err());
    }

    #[test]
    fn missing_module_has_context() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let err = open(&dir.path().join("absent.wasm")).err().expect("should fail");
        assert!(format!("{err:#}").contains("absent.wasm"));
    }
}
