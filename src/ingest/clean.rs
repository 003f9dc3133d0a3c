// src/ingest/clean.rs
use once_cell::sync::Lazy;
use regex::Regex;

pub const TITLE_MAX_CHARS: usize = 1000;
pub const DESCRIPTION_MAX_CHARS: usize = 5000;

static RE_CDATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("static regex"));
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[a-z!][^>]*>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Strip markup and entities from feed text and collapse whitespace.
pub fn clean_html(s: &str) -> String {
    // 1) Unwrap CDATA sections
    let mut out = RE_CDATA.replace_all(s, "$1").into_owned();

    // 2) Entity decode; feeds double-encode often enough that one pass is not enough
    for _ in 0..3 {
        let decoded = html_escape::decode_html_entities(&out).into_owned();
        if decoded == out {
            break;
        }
        out = decoded;
    }

    // 3) Strip tags (after decoding, so `&lt;p&gt;` goes too)
    out = RE_TAGS.replace_all(&out, " ").into_owned();

    // 4) NUL bytes break most databases
    out.retain(|c| c != '\0');

    // 5) Collapse whitespace
    RE_WS.replace_all(&out, " ").trim().to_string()
}

/// Clean, then cut to `max_chars` on a word boundary.
pub fn sanitize_for_db(s: &str, max_chars: usize) -> String {
    truncate_words(&clean_html(s), max_chars)
}

/// Truncate to at most `max_chars` characters, ending with `...`.
/// Prefers the last space in the kept half so words are not split.
pub fn truncate_words(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return s.chars().take(max_chars).collect();
    }
    let keep: String = s.chars().take(max_chars - 3).collect();
    let cut = match keep.rfind(' ') {
        Some(idx) if keep[..idx].chars().count() > (max_chars - 3) / 2 => &keep[..idx],
        _ => keep.as_str(),
    };
    format!("{}...", cut.trim_end())
}
