//! Description keys: the canonical token form two bids must share before
//! their line items are compared.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use unicode_normalization::UnicodeNormalization;

/// Multi-token phrases collapsed before single-token aliasing.
const PHRASES: &[(&[&str], &str)] = &[
    (&["sq", "ft"], "sf"),
    (&["sq", "feet"], "sf"),
    (&["square", "feet"], "sf"),
    (&["square", "foot"], "sf"),
    (&["s", "f"], "sf"),
    (&["lin", "ft"], "lf"),
    (&["linear", "feet"], "lf"),
    (&["linear", "foot"], "lf"),
    (&["lineal", "feet"], "lf"),
    (&["l", "f"], "lf"),
    (&["lump", "sum"], "ls"),
    (&["l", "s"], "ls"),
    (&["cubic", "yards"], "cy"),
    (&["cubic", "yard"], "cy"),
    (&["cu", "yd"], "cy"),
    (&["gypsum", "board"], "drywall"),
    (&["wall", "board"], "drywall"),
];

static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("demo", "demolition"),
        ("demolish", "demolition"),
        ("sqft", "sf"),
        ("sqf", "sf"),
        ("ft2", "sf"),
        ("lnft", "lf"),
        ("each", "ea"),
        ("lumpsum", "ls"),
        ("cuyd", "cy"),
        ("yd3", "cy"),
        ("gwb", "drywall"),
        ("sheetrock", "drywall"),
        ("gyp", "drywall"),
        ("flr", "floor"),
        ("flrg", "flooring"),
        ("exist", "existing"),
        ("ext", "existing"),
        ("installation", "install"),
        ("installed", "install"),
        ("removal", "remove"),
        ("removed", "remove"),
        ("elec", "electrical"),
        ("mech", "mechanical"),
        ("plumb", "plumbing"),
        ("painting", "paint"),
        ("qty", "quantity"),
    ])
});

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "a", "an", "the", "and", "or", "of", "to", "for", "in", "on", "at", "with", "w", "per",
        "by", "as", "all", "incl", "including", "includes", "provide", "furnish",
    ])
});

fn singular(token: &str) -> &str {
    if token.len() > 3
        && token.ends_with('s')
        && !token.ends_with("ss")
        && !token.chars().all(|c| c.is_ascii_digit() || c == 's')
    {
        &token[..token.len() - 1]
    } else {
        token
    }
}

/// Canonical tokens of a description, in their original order.
pub fn tokens(description: &str) -> Vec<String> {
    let folded: String = description
        .nfkc()
        .collect::<String>()
        .to_lowercase()
        .replace('&', " and ")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let raw: Vec<&str> = folded.split_whitespace().collect();

    let mut collapsed: Vec<&str> = Vec::with_capacity(raw.len());
    let mut i = 0;
    'outer: while i < raw.len() {
        for (phrase, replacement) in PHRASES {
            if raw[i..].starts_with(phrase) {
                collapsed.push(replacement);
                i += phrase.len();
                continue 'outer;
            }
        }
        collapsed.push(raw[i]);
        i += 1;
    }

    collapsed
        .into_iter()
        .map(|token| ALIASES.get(token).copied().unwrap_or(token))
        .map(singular)
        .map(|token| ALIASES.get(token).copied().unwrap_or(token))
        .filter(|token| !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Space-joined [`tokens`]; equal keys mean "the same described scope".
pub fn description_key(description: &str) -> String {
    tokens(description).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punctuation_case_and_spacing_do_not_matter() {
        assert_eq!(
            description_key("Demo existing flooring"),
            description_key("demo. existing  flooring")
        );
        assert_eq!(description_key("Demo existing flooring"), "demolition existing flooring");
    }

    #[test]
    fn units_and_trade_abbreviations_are_aliased() {
        assert_eq!(description_key("Hang GWB 5/8\" - 1,200 sq. ft."), "hang drywall 5 8 1 200 sf");
        assert_eq!(description_key("Base trim (lin ft)"), "base trim lf");
        assert_eq!(description_key("Haul-off, lump sum"), "haul off ls");
    }

    #[test]
    fn stop_words_and_plurals_are_dropped() {
        assert_eq!(description_key("Removal of the existing doors & frames"), "remove existing door frame");
        assert_eq!(description_key("Glass"), "glass");
    }

    #[test]
    fn fullwidth_characters_fold_under_nfkc() {
        assert_eq!(description_key("ＶＣＴ　ｆｌｏｏｒｉｎｇ"), "vct flooring");
    }
}
