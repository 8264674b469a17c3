//! Masking strategy implementations.
//!
//! Tokenization and pseudonymization are deterministic within a process:
//! the same input and category always produce the same replacement. They
//! are not stable across restarts because the maps are process-local.

use std::collections::HashMap;

use md5::Md5;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value as JsonValue};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{CompiledMaskingRule, CustomMaskFn, DataCategory, MaskingType, ResultMasker};

const COMMON_NAMES: [&str; 12] = [
    "John Smith",
    "Jane Doe",
    "Alex Johnson",
    "Sam Williams",
    "Taylor Brown",
    "Jordan Davis",
    "Casey Miller",
    "Pat Wilson",
    "Terry Moore",
    "Jamie Anderson",
    "Chris Taylor",
    "Jesse Thomas",
];

const COMMON_DOMAINS: [&str; 4] = ["example.com", "example.org", "example.net", "mail.test"];

fn opt_str<'a>(options: &'a Map<String, JsonValue>, key: &str, default: &'a str) -> &'a str {
    options.get(key).and_then(JsonValue::as_str).unwrap_or(default)
}

fn opt_u64(options: &Map<String, JsonValue>, key: &str, default: u64) -> u64 {
    options.get(key).and_then(JsonValue::as_u64).unwrap_or(default)
}

/// Stable 64-bit digest of a value, for deterministic replacements.
fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply a rule's strategy to one cell.
pub(crate) fn apply_rule(
    cell: &JsonValue,
    rule: &CompiledMaskingRule,
    masker: &ResultMasker,
    custom: &HashMap<String, CustomMaskFn>,
) -> JsonValue {
    // NULL stays NULL under every strategy.
    if cell.is_null() {
        return JsonValue::Null;
    }
    if rule.raw.masking_type == MaskingType::Nullify {
        return JsonValue::Null;
    }

    let value = value_to_string(cell);
    let masked = match rule.raw.masking_type {
        MaskingType::Full => full(&value, rule),
        MaskingType::Partial => partial(&value, rule),
        MaskingType::Hash => hash_mask(&value, rule, &masker.salt),
        MaskingType::Tokenize => tokenize(&value, rule, masker),
        MaskingType::Redact => "[REDACTED]".to_string(),
        MaskingType::Pseudonymize => pseudonymize(&value, rule, masker),
        MaskingType::Generalize => generalize(&value, rule),
        MaskingType::FormatPreserving => format_preserving(&value, rule),
        MaskingType::Custom => custom_mask(&value, rule, custom),
        // Handled above; kept for exhaustiveness.
        MaskingType::Nullify => return JsonValue::Null,
    };
    JsonValue::String(masked)
}

fn mask_char(rule: &CompiledMaskingRule) -> char {
    opt_str(&rule.raw.options, "mask_char", "X")
        .chars()
        .next()
        .unwrap_or('X')
}

fn full(value: &str, rule: &CompiledMaskingRule) -> String {
    if let Some(replacement) = &rule.raw.replacement {
        return replacement.clone();
    }
    let c = mask_char(rule);
    std::iter::repeat_n(c, value.chars().count()).collect()
}

fn partial(value: &str, rule: &CompiledMaskingRule) -> String {
    let c = mask_char(rule);

    // Pattern-scoped partial masking: only matched spans are replaced.
    if let Some(re) = &rule.pattern_re {
        return re
            .replace_all(value, |caps: &regex::Captures<'_>| {
                let len = caps[0].chars().count();
                std::iter::repeat_n(c, len).collect::<String>()
            })
            .into_owned();
    }

    let start_chars = opt_u64(&rule.raw.options, "start_chars", 0) as usize;
    let end_chars = opt_u64(&rule.raw.options, "end_chars", 0) as usize;
    let chars: Vec<char> = value.chars().collect();

    if chars.len() <= start_chars + end_chars {
        return std::iter::repeat_n(c, chars.len()).collect();
    }

    let mut out = String::with_capacity(chars.len());
    out.extend(&chars[..start_chars]);
    out.extend(std::iter::repeat_n(c, chars.len() - start_chars - end_chars));
    if end_chars > 0 {
        out.extend(&chars[chars.len() - end_chars..]);
    }
    out
}

fn hash_mask(value: &str, rule: &CompiledMaskingRule, default_salt: &str) -> String {
    let algorithm = opt_str(&rule.raw.options, "hash_algorithm", "sha256");
    let salt = opt_str(&rule.raw.options, "salt", default_salt);
    let prefix = opt_str(&rule.raw.options, "prefix", "");
    let salted = format!("{salt}{value}");

    let digest = match algorithm {
        "md5" => hex::encode(Md5::digest(salted.as_bytes())),
        "sha1" => hex::encode(Sha1::digest(salted.as_bytes())),
        _ => hex::encode(Sha256::digest(salted.as_bytes())),
    };
    format!("{prefix}{digest}")
}

fn tokenize(value: &str, rule: &CompiledMaskingRule, masker: &ResultMasker) -> String {
    let mut by_value = masker.state.token_by_value.lock();
    if let Some(token) = by_value.get(value) {
        return token.clone();
    }
    let prefix = opt_str(&rule.raw.options, "prefix", "TKN_");
    let token = format!("{prefix}{}", &Uuid::new_v4().simple().to_string()[..8]);
    by_value.insert(value.to_string(), token.clone());
    masker
        .state
        .value_by_token
        .lock()
        .insert(token.clone(), value.to_string());
    token
}

fn next_counter(masker: &ResultMasker, key: &str) -> u64 {
    let mut counters = masker.state.counters.lock();
    let counter = counters.entry(key.to_string()).or_insert(0);
    *counter += 1;
    *counter
}

fn pseudonymize(value: &str, rule: &CompiledMaskingRule, masker: &ResultMasker) -> String {
    let category = rule.raw.data_category;
    let key = (category.as_str().to_string(), value.to_string());

    if let Some(existing) = masker.state.pseudonyms.lock().get(&key) {
        return existing.clone();
    }

    let column = rule.raw.column.to_lowercase();
    let h = stable_hash(value);
    let pseudonym = match category {
        DataCategory::Pii => {
            if ["name", "first_name", "firstname", "last_name", "lastname"]
                .iter()
                .any(|n| column.contains(n))
            {
                COMMON_NAMES[(h % COMMON_NAMES.len() as u64) as usize].to_string()
            } else if column.contains("email") {
                let domain = COMMON_DOMAINS[(h % COMMON_DOMAINS.len() as u64) as usize];
                format!("user{}@{domain}", h % 10_000)
            } else if column.contains("phone") || column.contains("tel") {
                format!("(555) 555-{:04}", h % 10_000)
            } else {
                format!("Person_{}", next_counter(masker, "pii"))
            }
        },
        DataCategory::Phi => {
            if column.contains("id") || column.contains("patient") {
                format!("Patient_{}", next_counter(masker, "phi"))
            } else {
                format!("Medical_{}", next_counter(masker, "phi"))
            }
        },
        DataCategory::Pci => {
            if column.contains("card") || column.contains("cc") {
                format!("9999-9999-9999-{:04}", h % 10_000)
            } else {
                format!("Card_{}", next_counter(masker, "pci"))
            }
        },
        DataCategory::Location => format!("Location_{}", next_counter(masker, "location")),
        _ => format!("Pseudonym_{}", next_counter(masker, "default")),
    };

    masker
        .state
        .pseudonyms
        .lock()
        .insert(key, pseudonym.clone());
    pseudonym
}

fn generalize(value: &str, rule: &CompiledMaskingRule) -> String {
    let column = rule.raw.column.to_lowercase();
    match rule.raw.data_category {
        DataCategory::Pii => {
            if column.contains("age") || column.contains("years") {
                generalize_age(value, &rule.raw.options)
            } else if column.contains("birth") || column.contains("dob") {
                generalize_date(value, &rule.raw.options)
            } else {
                "GENERALIZED".to_string()
            }
        },
        DataCategory::Location => {
            if column.contains("zip") || column.contains("postal") {
                generalize_zip(value, &rule.raw.options)
            } else if column.contains("address") || column.contains("street") {
                "ADDRESS".to_string()
            } else if column.contains("city") {
                "CITY".to_string()
            } else if column.contains("state") || column.contains("province") {
                "STATE".to_string()
            } else if column.contains("country") {
                "COUNTRY".to_string()
            } else {
                "LOCATION".to_string()
            }
        },
        DataCategory::Financial => {
            if column.contains("income") || column.contains("salary") {
                generalize_income(value, &rule.raw.options)
            } else {
                "FINANCIAL_DATA".to_string()
            }
        },
        _ => "GENERALIZED_DATA".to_string(),
    }
}

fn generalize_age(value: &str, options: &Map<String, JsonValue>) -> String {
    let Ok(age) = value.trim().parse::<u64>() else {
        return "UNKNOWN".to_string();
    };
    let bin = opt_u64(options, "bin_size", 10).max(1);
    let lower = (age / bin) * bin;
    format!("{lower}-{}", lower + bin - 1)
}

fn generalize_income(value: &str, options: &Map<String, JsonValue>) -> String {
    let cleaned: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    let Ok(income) = cleaned.parse::<f64>() else {
        return "UNKNOWN".to_string();
    };
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bin = opt_u64(options, "bin_size", 10_000).max(1);
    let lower = ((income / bin as f64).floor() as u64) * bin;
    format!("${lower}-${}", lower + bin - 1)
}

fn generalize_zip(value: &str, options: &Map<String, JsonValue>) -> String {
    if value.len() < 5 {
        return "XXXXX".to_string();
    }
    let keep = opt_u64(options, "digits_to_keep", 3) as usize;
    let kept: String = value.chars().take(keep).collect();
    format!("{kept}XX")
}

fn generalize_date(value: &str, options: &Map<String, JsonValue>) -> String {
    let formats = ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%d-%m-%Y", "%m-%d-%Y"];
    let Some(date) = formats
        .iter()
        .find_map(|fmt| chrono::NaiveDate::parse_from_str(value.trim(), fmt).ok())
    else {
        return "DATE".to_string();
    };

    use chrono::Datelike;
    match opt_str(options, "generalize_level", "month") {
        "year" => date.year().to_string(),
        "quarter" => format!("{}-Q{}", date.year(), (date.month() - 1) / 3 + 1),
        "decade" => format!("{}s", (date.year() / 10) * 10),
        _ => format!("{}-{:02}", date.year(), date.month()),
    }
}

fn format_preserving(value: &str, rule: &CompiledMaskingRule) -> String {
    let c = mask_char(rule);
    // Seeded per value so the substitution is deterministic in-process.
    let mut rng = StdRng::seed_from_u64(stable_hash(value));

    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_digit() {
                char::from(b'0' + rng.gen_range(0..10u8))
            } else if ch.is_uppercase() {
                c.to_ascii_uppercase()
            } else if ch.is_lowercase() {
                c.to_ascii_lowercase()
            } else {
                ch
            }
        })
        .collect()
}

fn custom_mask(
    value: &str,
    rule: &CompiledMaskingRule,
    custom: &HashMap<String, CustomMaskFn>,
) -> String {
    let Some(function) = rule.raw.options.get("function").and_then(JsonValue::as_str) else {
        return "[MASKED]".to_string();
    };
    match custom.get(function) {
        Some(f) => f(value, &rule.raw.options),
        // Load-time validation makes this unreachable in practice.
        None => {
            tracing::warn!(function, "custom masking function not found");
            "[MASKED]".to_string()
        },
    }
}
