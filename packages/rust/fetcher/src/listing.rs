//! Directory-listing parsing and archive selection.
//!
//! The registry index is a plain Apache-style listing: the root lists one
//! `YYYY-MM/` directory per publication month, and each month lists its
//! `.zip` archives.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use egressos_shared::Month;
use regex::Regex;
use scraper::{Html, Selector};

/// Matches a month directory link such as `2025-09/` or `/dados/2025-09/`.
static MONTH_HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|/)(\d{4}-\d{2})/?$").expect("month href regex"));

/// Prefix values that disable filtering.
const ALL_PREFIXES: [&str; 3] = ["all", "todos", "*"];

fn hrefs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    // Static selector; parse cannot fail.
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(|h| h.trim().to_string())
        .collect()
}

/// Publication months linked from the index root, ascending.
pub fn parse_months(html: &str) -> Vec<Month> {
    let months: BTreeSet<Month> = hrefs(html)
        .iter()
        .filter_map(|href| MONTH_HREF_RE.captures(href))
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    months.into_iter().collect()
}

/// Archive file names linked from a month listing, de-duplicated and sorted.
pub fn parse_archive_names(html: &str) -> Vec<String> {
    let names: BTreeSet<String> = hrefs(html)
        .iter()
        .filter(|href| href.to_ascii_lowercase().ends_with(".zip"))
        .filter_map(|href| href.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.into_iter().collect()
}

/// Normalize prefix filters.
///
/// Each entry may itself hold several prefixes separated by `,` or `;`.
/// Returns an empty list (no filtering) when nothing remains or when any
/// entry is `all`, `todos` or `*`.
pub fn normalize_prefixes<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut prefixes = Vec::new();
    for entry in raw {
        for part in entry.as_ref().split([',', ';']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if ALL_PREFIXES.contains(&part.to_ascii_lowercase().as_str()) {
                return Vec::new();
            }
            let lowered = part.to_ascii_lowercase();
            if !prefixes.contains(&lowered) {
                prefixes.push(lowered);
            }
        }
    }
    prefixes
}

/// Apply prefix filtering (case-insensitive) and the file cap to sorted names.
///
/// A negative `max_files` keeps everything; `0` keeps nothing.
pub fn select_archives(names: &[String], prefixes: &[String], max_files: i64) -> Vec<String> {
    let matching = names.iter().filter(|name| {
        prefixes.is_empty() || {
            let lowered = name.to_ascii_lowercase();
            prefixes.iter().any(|p| lowered.starts_with(p.as_str()))
        }
    });
    match usize::try_from(max_files) {
        Ok(cap) => matching.take(cap).cloned().collect(),
        Err(_) => matching.cloned().collect(),
    }
}
