//! Tokens command - print highlighted spans.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use ulight_host::Token;

/// A token together with the text it covers.
#[derive(Serialize)]
struct Span<'a> {
    #[serde(flatten)]
    token: Token,
    text: &'a str,
}

/// Run the tokens command.
pub fn run(module: &Path, input: Option<&Path>, lang: Option<&str>, json: bool) -> Result<()> {
    let mut instance = super::open(module)?;
    let source = super::read_input(input)?;
    let language = super::select_language(&mut instance, lang, input)?;

    let tokens = instance
        .tokenize(&source, language.clone())
        .with_context(|| format!("Failed to tokenize as {language}"))?;
    let source = std::str::from_utf8(&source).context("Source is not valid UTF-8")?;

    println!("{}", render(source, &tokens, json)?);
    Ok(())
}

/// Format tokens as a table or as a JSON array.
fn render(source: &str, tokens: &[Token], json: bool) -> Result<String> {
    let spans = tokens
        .iter()
        .map(|token| {
            let text = source
                .get(token.range()?)
                .with_context(|| format!("Token {token:?} is outside the source"))?;
            Ok(Span { token: *token, text })
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        return serde_json::to_string_pretty(&spans).context("Failed to serialize tokens");
    }

    let mut out = format!("{:>8} {:>8} {:>4}  TEXT", "BEGIN", "LENGTH", "KIND");
    for span in &spans {
        out.push_str(&format!(
            "\n{:>8} {:>8} {:>4}  {:?}",
            span.token.begin, span.token.length, span.token.kind, span.text
        ));
    }
    Ok(out)
}
