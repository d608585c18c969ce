//! Languages command - list the languages the module supports.

use anyhow::{Context, Result};
use std::path::Path;
use ulight_host::LanguageEntry;

/// Run the languages command.
pub fn run(module: &Path, json: bool) -> Result<()> {
    let mut instance = super::open(module)?;
    let languages = instance
        .list_languages()
        .context("Failed to read the language table")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&languages).context("Failed to serialize languages")?
        );
    } else {
        print!("{}", table(&languages));
    }
    Ok(())
}

/// One line per name, aliases included.
fn table(languages: &[LanguageEntry]) -> String {
    let width = languages.iter().map(|l| l.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for entry in languages {
        out.push_str(&format!(
            "{:<width$}  {:>4}  {}\n",
            entry.name, entry.id, entry.display_name
        ));
    }
    out.push_str(&format!("\n{} names\n", languages.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulight_host::testing;

    #[test]
    fn table_aligns_names() {
        let mut instance = testing::bound_instance();
        let languages = instance.list_languages().unwrap();
        let out = table(&languages);

        assert!(out.contains("javascript     7  JavaScript"));
        assert!(out.contains("js             7  JavaScript"));
        assert!(out.ends_with("5 names\n"));
    }
}
