//! Year selector grammar: `all`, `2023`, `2019-2021`, `2018,2020-2022`.

use std::collections::BTreeSet;
use std::path::Path;

use crate::archive::discover_years;
use crate::error::AuditError;

const MIN_YEAR: i32 = 1000;
const MAX_YEAR: i32 = 9999;

/// One comma-separated piece of a selector.
#[derive(Debug, Clone, PartialEq)]
enum YearToken {
    Single(i32),
    Range { text: String, from: i32, to: i32 },
}

/// Resolve a selector into ascending, duplicate-free years. `all` expands to
/// the archive files actually present in `archive_dir`; ranges keep only the
/// years that have an archive file. A year named on its own is kept as is,
/// so a missing file for it is reported when the archive is opened.
pub fn resolve_years(selector: &str, archive_dir: &Path, normalized: bool) -> Result<Vec<i32>, AuditError> {
    let selector = selector.trim();
    let present = discover_years(archive_dir, normalized);
    if selector.eq_ignore_ascii_case("all") {
        if present.is_empty() {
            return Err(AuditError::NoArchives {
                dir: archive_dir.to_path_buf(),
            });
        }
        return Ok(present);
    }
    expand(&parse_tokens(selector)?, Some(present.as_slice()))
}

/// With `present`, ranges are narrowed to it and must not come out empty.
fn expand(tokens: &[YearToken], present: Option<&[i32]>) -> Result<Vec<i32>, AuditError> {
    let mut years = BTreeSet::new();
    for token in tokens {
        match token {
            YearToken::Single(year) => {
                years.insert(*year);
            }
            YearToken::Range { text, from, to } => match present {
                Some(present) => {
                    let hits: Vec<i32> = present
                        .iter()
                        .copied()
                        .filter(|y| (*from..=*to).contains(y))
                        .collect();
                    if hits.is_empty() {
                        return Err(invalid(text, "no archive file in this range"));
                    }
                    years.extend(hits);
                }
                None => years.extend(*from..=*to),
            },
        }
    }
    Ok(years.into_iter().collect())
}

fn parse_tokens(selector: &str) -> Result<Vec<YearToken>, AuditError> {
    let mut tokens = Vec::new();
    for token in selector.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid(token, "empty token"));
        }
        match token.split_once('-') {
            Some((from, to)) => {
                let from = parse_year(from.trim(), token)?;
                let to = parse_year(to.trim(), token)?;
                if from > to {
                    return Err(invalid(token, "inverted range"));
                }
                tokens.push(YearToken::Range {
                    text: token.to_string(),
                    from,
                    to,
                });
            }
            None => tokens.push(YearToken::Single(parse_year(token, token)?)),
        }
    }
    Ok(tokens)
}

fn parse_year(raw: &str, token: &str) -> Result<i32, AuditError> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(token, "not a year"));
    }
    let year: i32 = raw.parse().map_err(|_| invalid(token, "not a year"))?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(invalid(token, "year must have four digits"));
    }
    Ok(year)
}

fn invalid(token: &str, reason: &str) -> AuditError {
    AuditError::InvalidYearToken {
        token: token.to_string(),
        reason: reason.to_string(),
    }
}
