//! Makefile-style dep-info parsing.
//!
//! Compilers that report what they read (`rustc --emit=dep-info`, `gcc -MD`)
//! write Makefile fragments. Rules whose steps emit such a file can back
//! `inputs_after_building_locally` with this parser.
//!
//! Escaping rules honored: `\` + newline is a line continuation, `\ ` is a
//! literal space, `\\` a literal backslash, `\#` a literal hash.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::InputDescriptor;

#[derive(Debug, Error)]
pub enum DepInfoError {
    #[error("failed to read dep-info file {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dep-info file {path} is not valid UTF-8")]
    InvalidUtf8 { path: Utf8PathBuf },
}

/// Parse a dep-info file and return its dependency paths, deduplicated in
/// first-seen order. Target names before the `:` are discarded.
pub fn parse_dep_info_file(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DepInfoError> {
    let bytes = std::fs::read(path).map_err(|source| DepInfoError::Io {
        path: path.to_owned(),
        source,
    })?;
    let content = std::str::from_utf8(&bytes).map_err(|_| DepInfoError::InvalidUtf8 {
        path: path.to_owned(),
    })?;
    Ok(parse_dep_info(content))
}

/// Parse dep-info content.
pub fn parse_dep_info(content: &str) -> Vec<Utf8PathBuf> {
    let mut deps: Vec<Utf8PathBuf> = Vec::new();

    for rule_line in logical_lines(content) {
        // Only the part after the first unescaped ':' names dependencies.
        let Some(dep_part) = split_deps(&rule_line) else {
            continue;
        };
        for token in tokenize(dep_part) {
            let path = Utf8PathBuf::from(token);
            if !deps.contains(&path) {
                deps.push(path);
            }
        }
    }

    deps
}

/// Parse a dep-info file into dep-file entries, keeping only paths under the
/// project root (rebased to project-relative form). Toolchain and system
/// paths outside the root are covered by other key inputs and dropped here.
pub fn dep_info_descriptors(
    path: &Utf8Path,
    project_root: &Utf8Path,
) -> Result<Vec<InputDescriptor>, DepInfoError> {
    let deps = parse_dep_info_file(path)?;
    Ok(deps
        .into_iter()
        .filter_map(|dep| {
            if dep.is_absolute() {
                dep.strip_prefix(project_root)
                    .ok()
                    .map(|rel| InputDescriptor::new(rel.to_owned()))
            } else {
                Some(InputDescriptor::new(dep))
            }
        })
        .collect())
}

/// Join continuation lines (`\` at end of line) into logical rule lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for raw in content.lines() {
        // A trailing backslash that is not itself escaped continues the line.
        let trailing_backslashes = raw.chars().rev().take_while(|&c| c == '\\').count();
        if trailing_backslashes % 2 == 1 {
            current.push_str(&raw[..raw.len() - 1]);
            current.push(' ');
        } else {
            current.push_str(raw);
            if !current.trim().is_empty() {
                lines.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current);
    }

    lines
}

/// The substring after the first unescaped `:`, or `None` for non-rule lines.
fn split_deps(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b':' => return Some(&line[i + 1..]),
            _ => i += 1,
        }
    }
    None
}

/// Split on unescaped whitespace, resolving escapes inside tokens.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(' ') => current.push(' '),
                Some('\\') => current.push('\\'),
                Some('#') => current.push('#'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ' ' | '\t' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
