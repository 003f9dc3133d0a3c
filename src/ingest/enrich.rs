//! Article enrichment: mentioned coins, breaking flag, category and a
//! fallback GUID. Everything here is pure; callers pass `now` explicitly.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::models::Article;

/// Canonical symbol and the names it is written as.
const COIN_TABLE: &[(&str, &[&str])] = &[
    ("BTC", &["bitcoin", "btc"]),
    ("ETH", &["ethereum", "ether", "eth"]),
    ("BNB", &["binance coin", "binance", "bnb"]),
    ("XRP", &["ripple", "xrp"]),
    ("SOL", &["solana", "sol"]),
    ("DOGE", &["dogecoin", "doge"]),
    ("ADA", &["cardano", "ada"]),
    ("AVAX", &["avalanche", "avax"]),
    ("DOT", &["polkadot", "dot"]),
    ("MATIC", &["polygon", "matic"]),
    ("LINK", &["chainlink", "link"]),
    ("UNI", &["uniswap", "uni"]),
    ("ATOM", &["cosmos", "atom"]),
    ("LTC", &["litecoin", "ltc"]),
    ("ETC", &["ethereum classic", "etc"]),
    ("XLM", &["stellar", "xlm"]),
    ("ALGO", &["algorand", "algo"]),
    ("VET", &["vechain", "vet"]),
    ("FIL", &["filecoin", "fil"]),
    ("NEAR", &["near protocol", "near"]),
    ("APT", &["aptos", "apt"]),
    ("ARB", &["arbitrum", "arb"]),
    ("OP", &["optimism"]),
    ("SUI", &["sui"]),
    ("SEI", &["sei"]),
    ("TIA", &["celestia", "tia"]),
    ("INJ", &["injective", "inj"]),
    ("PEPE", &["pepe"]),
    ("SHIB", &["shiba inu", "shib"]),
    ("BONK", &["bonk"]),
    ("WIF", &["dogwifhat", "wif"]),
    ("USDT", &["tether", "usdt"]),
    ("USDC", &["usdc", "usd coin"]),
];

/// Checked in order; first category with a whole-word hit wins.
const CATEGORY_TABLE: &[(&str, &[&str])] = &[
    ("defi", &["defi", "decentralized finance", "yield", "liquidity", "apy", "tvl", "lending", "borrowing"]),
    ("nft", &["nft", "nfts", "non-fungible", "opensea", "blur", "digital art", "collectible"]),
    ("regulation", &["sec", "regulation", "law", "legal", "compliance", "ban", "sanction", "lawsuit"]),
    ("exchange", &["binance", "coinbase", "kraken", "exchange", "trading", "listing", "delisting"]),
    ("mining", &["mining", "miner", "miners", "hash rate", "proof of work", "pow"]),
    ("staking", &["staking", "stake", "proof of stake", "pos", "validator", "validators"]),
    ("layer2", &["layer 2", "layer-2", "l2", "rollup", "rollups", "zk", "optimistic", "scaling"]),
    ("market", &["price", "market", "bullish", "bearish", "rally", "crash", "pump", "dump"]),
    ("technology", &["upgrade", "fork", "protocol", "development", "mainnet", "testnet"]),
];

pub const DEFAULT_CATEGORY: &str = "general";

const BREAKING_KEYWORDS: &[&str] = &["breaking", "just in", "urgent", "alert", "flash", "developing"];
const BREAKING_WINDOW_HOURS: i64 = 2;

/// Prefix that tells generated GUIDs apart from provider-issued ones.
pub const GENERATED_GUID_PREFIX: &str = "gen-";

fn word_alternation(variants: &[&str]) -> Regex {
    let alts: Vec<String> = variants.iter().map(|v| regex::escape(v)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alts.join("|"))).expect("static coin/category pattern")
}

static COIN_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    COIN_TABLE
        .iter()
        .map(|(sym, variants)| (*sym, word_alternation(variants)))
        .collect()
});

static CATEGORY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    CATEGORY_TABLE
        .iter()
        .map(|(cat, words)| (*cat, word_alternation(words)))
        .collect()
});

/// Symbols mentioned in `text`, in coin table order.
/// Never returns duplicates; no match yields an empty vec.
pub fn detect_coins(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    COIN_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(sym, _)| sym.to_string())
        .collect()
}

/// Keyword-based category, if any table entry matches.
pub fn detect_category(text: &str) -> Option<&'static str> {
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(cat, _)| *cat)
}

/// Published within the last two hours, or a breaking keyword in the title.
pub fn is_breaking(title: &str, pub_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if pub_date > now - Duration::hours(BREAKING_WINDOW_HOURS) {
        return true;
    }
    let lower = title.to_lowercase();
    BREAKING_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Deterministic GUID from source id, link and title.
pub fn generate_guid(source_id: i64, link: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source_id}|{link}|{title}").as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(GENERATED_GUID_PREFIX.len() + 32);
    out.push_str(GENERATED_GUID_PREFIX);
    for b in &digest[..16] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Fill coins, breaking flag, a missing GUID and a missing category in place.
pub fn enrich(article: &mut Article, source_category: &str, now: DateTime<Utc>) {
    let text = format!("{} {}", article.title, article.description);

    article.coins = detect_coins(&text);
    article.is_breaking = is_breaking(&article.title, article.pub_date, now);

    if article.guid.trim().is_empty() {
        article.guid = generate_guid(article.source_id, &article.link, &article.title);
    }

    if article.categories.is_empty() {
        let category = if !source_category.is_empty() && source_category != DEFAULT_CATEGORY {
            source_category
        } else {
            detect_category(&text).unwrap_or(DEFAULT_CATEGORY)
        };
        article.categories.push(category.to_string());
    }
}
