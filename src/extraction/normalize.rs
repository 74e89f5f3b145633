// src/extraction/normalize.rs
//
// Deterministic, total normalizers. Each returns None when the input cannot
// produce a usable value; callers record that as an extraction issue.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

static EXTENSION_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:ext\.?|extension|x)\s*\d+\s*$").expect("valid extension regex")
});

/// Digits only, NANP country code stripped, extension dropped.
/// Valid results are 7 to 15 digits long.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let without_ext = EXTENSION_SPLIT.replace(phone.trim(), "");
    let digits_only: String = without_ext.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits_only.len() == 11 && digits_only.starts_with('1') {
        return Some(digits_only[1..].to_string());
    }
    if (7..=15).contains(&digits_only.len()) {
        return Some(digits_only);
    }
    debug!(
        "Phone number '{}' normalized to '{}', considered invalid for matching.",
        phone, digits_only
    );
    None
}

/// Trimmed and lower-cased. Plus-tags are removed and Gmail dots folded so the
/// same mailbox always compares equal.
pub fn normalize_email(email: &str) -> Option<String> {
    let email_trimmed = email.trim().to_lowercase();
    let (local_part_full, domain_part) = email_trimmed.split_once('@')?;
    if domain_part.is_empty() || !domain_part.contains('.') || domain_part.contains('@') {
        return None;
    }

    let local_part_no_plus = local_part_full.split('+').next().unwrap_or("");

    let final_domain_part = match domain_part {
        "googlemail.com" => "gmail.com",
        _ => domain_part,
    };

    let final_local_part = if final_domain_part == "gmail.com" {
        local_part_no_plus.replace('.', "")
    } else {
        local_part_no_plus.to_string()
    };

    if final_local_part.is_empty() {
        None
    } else {
        Some(format!("{}@{}", final_local_part, final_domain_part))
    }
}

/// Digits only. ISO 11784/11785 chips carry 15 digits; older AVID and
/// FECAVA chips read as 9 or 10.
pub fn normalize_microchip(chip: &str) -> Option<String> {
    let digits: String = chip.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        9 | 10 | 15 => Some(digits),
        _ => {
            debug!("Microchip '{}' has {} digits, not a valid chip", chip, digits.len());
            None
        }
    }
}

const HONORIFICS: [&str; 8] = ["mr", "mrs", "ms", "miss", "mx", "dr", "prof", "rev"];
const NAME_SUFFIXES: [&str; 7] = ["jr", "sr", "ii", "iii", "iv", "esq", "phd"];

/// Lower-case, punctuation stripped, honorifics and generational suffixes
/// removed, whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = name.to_lowercase();
    let char_substitutions = [
        ("&", " and "),
        ("/", " "),
        ("-", " "),
        (".", " "),
        ("'", ""),
        ("\u{2019}", ""),
        ("(", " "),
        (")", " "),
        (",", " "),
        ("\"", " "),
    ];
    for (pattern, replacement) in &char_substitutions {
        normalized = normalized.replace(pattern, replacement);
    }
    let tokens: Vec<String> = normalized
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|t| !t.is_empty())
        .collect();

    let mut start = 0;
    while start < tokens.len() && tokens.len() - start > 1 && HONORIFICS.contains(&tokens[start].as_str()) {
        start += 1;
    }
    let mut end = tokens.len();
    while end > start + 1 && NAME_SUFFIXES.contains(&tokens[end - 1].as_str()) {
        end -= 1;
    }
    tokens[start..end].join(" ")
}

const STREET_SUFFIXES: [(&str, &str); 22] = [
    ("str", "street"),
    ("rd", "road"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("blvd", "boulevard"),
    ("blv", "boulevard"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("ct", "court"),
    ("pl", "place"),
    ("sq", "square"),
    ("pkwy", "parkway"),
    ("cir", "circle"),
    ("hwy", "highway"),
    ("ter", "terrace"),
    ("trl", "trail"),
    ("wy", "way"),
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("mt", "mount"),
];

/// Unit designators recognized in free-text addresses. All canonicalize to `unit`.
const UNIT_DESIGNATORS: [&str; 12] = [
    "apt", "apartment", "suite", "ste", "unit", "#", "room", "rm", "space", "spc", "lot", "trlr",
];

fn address_tokens(address: &str) -> Vec<String> {
    let lower = address.to_lowercase();
    let spaced: String = lower
        .chars()
        .map(|c| if c == ',' || c == '.' { ' ' } else { c })
        .collect();
    let mut tokens = Vec::new();
    for raw in spaced.split_whitespace() {
        // "#12" reads as designator and value.
        if let Some(rest) = raw.strip_prefix('#') {
            tokens.push("#".to_string());
            let rest: String = rest.chars().filter(|c| c.is_alphanumeric()).collect();
            if !rest.is_empty() {
                tokens.push(rest);
            }
            continue;
        }
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        if !cleaned.is_empty() {
            tokens.push(cleaned);
        }
    }
    tokens
}

/// Splits unit designator/value pairs out of an address token list.
fn split_units(tokens: Vec<String>) -> (Vec<String>, Option<String>) {
    let mut street = Vec::with_capacity(tokens.len());
    let mut unit = None;
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        if UNIT_DESIGNATORS.contains(&token) && i + 1 < tokens.len() {
            let value = tokens[i + 1].trim_matches('-');
            if !value.is_empty() && (value.chars().any(|c| c.is_ascii_digit()) || value.len() <= 2) {
                if unit.is_none() {
                    unit = Some(value.to_string());
                }
                i += 2;
                continue;
            }
        }
        street.push(tokens[i].clone());
        i += 1;
    }
    (street, unit)
}

/// Canonical form of a street address with street suffixes expanded and any
/// unit designator removed.
pub fn normalize_address(address: &str) -> String {
    let (street, _) = split_units(address_tokens(address));
    let last = street.len().saturating_sub(1);
    street
        .iter()
        .enumerate()
        .map(|(i, token)| {
            if token == "st" {
                // "St" right after the house number starts a name ("St Helena Rd").
                let leads_name = i != last
                    && (i == 0 || (i == 1 && street[0].chars().all(|c| c.is_ascii_digit())));
                return if leads_name { "saint" } else { "street" }.to_string();
            }
            STREET_SUFFIXES
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map(|(_, full)| full.to_string())
                .unwrap_or_else(|| token.clone())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The unit embedded in a free-text address, as `unit <value>`.
pub fn extract_unit(address: &str) -> Option<String> {
    split_units(address_tokens(address))
        .1
        .map(|value| format!("unit {}", value))
}

/// Canonicalizes a dedicated unit field ("Apt 4B", "#4", "4b") to `unit <value>`.
pub fn normalize_unit(raw: &str) -> Option<String> {
    let tokens = address_tokens(raw);
    let value = match tokens.as_slice() {
        [] => return None,
        [only] if UNIT_DESIGNATORS.contains(&only.as_str()) => return None,
        [designator, value, ..] if UNIT_DESIGNATORS.contains(&designator.as_str()) => value.clone(),
        _ => tokens.join(""),
    };
    let value = value.trim_matches('-');
    if value.is_empty() {
        None
    } else {
        Some(format!("unit {}", value))
    }
}

/// External geocode key for a place: normalized street address plus unit.
pub fn geocode_key(formatted_address: &str, unit: Option<&str>) -> String {
    format!("{}|{}", normalize_address(formatted_address), unit.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_normalization() {
        assert_eq!(normalize_phone("707-555-1234"), Some("7075551234".into()));
        assert_eq!(normalize_phone("+1 (707) 555-1234"), Some("7075551234".into()));
        assert_eq!(normalize_phone("707.555.1234 ext 22"), Some("7075551234".into()));
        assert_eq!(normalize_phone("555-12"), None);
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn test_email_normalization() {
        assert_eq!(normalize_email("  Susan.Smith+cats@GMail.com "), Some("susansmith@gmail.com".into()));
        assert_eq!(normalize_email("ann@googlemail.com"), Some("ann@gmail.com".into()));
        assert_eq!(normalize_email("bob.jones@example.org"), Some("bob.jones@example.org".into()));
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("+tag@example.org"), None);
        assert_eq!(normalize_email("ann@localhost"), None);
    }

    #[test]
    fn test_microchip_normalization() {
        assert_eq!(normalize_microchip("985 112 012 345 678"), Some("985112012345678".into()));
        assert_eq!(normalize_microchip("AVID*012*345*678"), Some("012345678".into()));
        assert_eq!(normalize_microchip("12345"), None);
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_name("  Dr. Susan  O'Neil-Smith, Jr. "), "susan oneil smith");
        assert_eq!(normalize_name("SMITH, SUSAN"), "smith susan");
        assert_eq!(normalize_name("Mr"), "mr");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn test_address_normalization_strips_units_without_double_spaces() {
        assert_eq!(
            normalize_address("123 Main St., Apt 4, Santa Rosa, CA 95401"),
            "123 main street santa rosa ca 95401"
        );
        assert_eq!(
            normalize_address("123 MAIN STREET #4 Santa Rosa CA 95401"),
            "123 main street santa rosa ca 95401"
        );
        assert_eq!(normalize_address("500 N Dutton Ave"), "500 north dutton avenue");
        assert_eq!(normalize_address("10 St Helena Rd"), "10 saint helena road");
        assert_eq!(
            normalize_address("9 Elm St Santa Rosa CA"),
            "9 elm street santa rosa ca"
        );
    }

    #[test]
    fn test_unit_extraction_is_canonical() {
        assert_eq!(extract_unit("123 Main St Apt 4B"), Some("unit 4b".into()));
        assert_eq!(extract_unit("123 Main St #12"), Some("unit 12".into()));
        assert_eq!(extract_unit("88 Oak Ln Space 7"), Some("unit 7".into()));
        assert_eq!(extract_unit("123 Main St"), None);
        assert_eq!(normalize_unit("Suite 200"), Some("unit 200".into()));
        assert_eq!(normalize_unit("#4"), Some("unit 4".into()));
        assert_eq!(normalize_unit("4B"), Some("unit 4b".into()));
        assert_eq!(normalize_unit("  "), None);
    }

    #[test]
    fn test_geocode_key_combines_address_and_unit() {
        assert_eq!(
            geocode_key("123 Main St, Santa Rosa, CA 95401, USA", Some("unit 4")),
            "123 main street santa rosa ca 95401 usa|unit 4"
        );
        assert_eq!(geocode_key("123 Main Street", None), "123 main street|");
    }
}
