//! Argument builder.
//!
//! Turns the operator's raw inputs into the argument vector handed to a tool:
//! one `--domain <value>` pair per target, in the order given, followed by the
//! free-form argument tokens. The only I/O is a read-only probe that the
//! output directory exists.

use std::path::{Path, PathBuf};

use crate::error::ValidationError;
use crate::rlog_debug;

/// Flag emitted before every target domain.
pub const DOMAIN_FLAG: &str = "--domain";

/// Validated builder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArgs {
    /// Trimmed domains in input order.
    pub domains: Vec<String>,
    /// `--domain` pairs followed by the free-form tokens.
    pub args: Vec<String>,
    /// The output directory, known to exist at build time.
    pub output_dir: PathBuf,
}

/// Validate the inputs and produce the argument vector for a task.
pub fn build_args(
    raw_domains: &str,
    extra_args: &str,
    output_dir: &str,
) -> Result<BuiltArgs, ValidationError> {
    let domains = parse_domains(raw_domains)?;
    let output_dir = check_output_dir(output_dir)?;
    let extra = tokenize(extra_args)?;

    let mut args = Vec::with_capacity(domains.len() * 2 + extra.len());
    for domain in &domains {
        args.push(DOMAIN_FLAG.to_string());
        args.push(domain.clone());
    }
    args.extend(extra);

    rlog_debug!("build_args: domains={:?} args={:?}", domains, args);
    Ok(BuiltArgs {
        domains,
        args,
        output_dir,
    })
}

/// Split a comma-separated domain string, trimming each entry.
///
/// Every entry must be non-empty after trimming; `"a.com,,b.com"` is rejected
/// rather than silently collapsed. Duplicates are kept.
pub fn parse_domains(raw: &str) -> Result<Vec<String>, ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::EmptyDomains);
    }

    raw.split(',')
        .enumerate()
        .map(|(i, part)| {
            let domain = part.trim();
            if domain.is_empty() {
                Err(ValidationError::EmptyDomainEntry { position: i + 1 })
            } else {
                Ok(domain.to_string())
            }
        })
        .collect()
}

/// The directory must be named and must already exist.
pub fn check_output_dir(dir: &str) -> Result<PathBuf, ValidationError> {
    if dir.trim().is_empty() {
        return Err(ValidationError::EmptyOutputDir);
    }
    let path = Path::new(dir);
    if !path.is_dir() {
        return Err(ValidationError::OutputDirMissing(dir.to_string()));
    }
    Ok(path.to_path_buf())
}

/// Split a command line into words.
///
/// Words are separated by whitespace. Single quotes take their contents
/// literally; double quotes group words and honor `\"` and `\\`. Quotes may
/// appear mid-word (`--header="X: y"` is one token).
pub fn tokenize(input: &str) -> Result<Vec<String>, ValidationError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(ValidationError::UnbalancedQuote(input.to_string())),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(ValidationError::UnbalancedQuote(input.to_string()))
                            }
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(ValidationError::UnbalancedQuote(input.to_string())),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
