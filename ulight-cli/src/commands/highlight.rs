//! Highlight command - render source as HTML.

use anyhow::{Context, Result};
use std::path::Path;

/// Run the highlight command.
pub fn run(
    module: &Path,
    input: Option<&Path>,
    lang: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let mut instance = super::open(module)?;
    let source = super::read_input(input)?;
    let language = super::select_language(&mut instance, lang, input)?;

    let html = instance
        .highlight(&source, language.clone())
        .with_context(|| format!("Failed to highlight as {language}"))?;

    match output {
        Some(path) => {
            std::fs::write(path, &html)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = html.len(), "Wrote highlighted HTML");
        }
        None => print!("{html}"),
    }
    Ok(())
}
