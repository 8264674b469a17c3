//! PII detection over free-text cells.
//!
//! Detectors run as a secondary masking pass: each pattern's matches are
//! masked in place even when no column rule applied. Patterns are compiled
//! once at construction.

use regex::Regex;

struct Detector {
    name:    &'static str,
    pattern: Regex,
    mask:    fn(&str) -> String,
}

/// Compiled PII detectors for credit cards, emails, phones, SSNs, IP
/// addresses and dates of birth.
pub struct PiiDetectors {
    detectors: Vec<Detector>,
}

impl Default for PiiDetectors {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiDetectors {
    /// Compile the default detector set.
    #[must_use]
    pub fn new() -> Self {
        let re = |p: &str| Regex::new(p).expect("static pattern compiles");
        // Order matters: credit cards and SSNs would otherwise be eaten by
        // the looser phone pattern.
        let detectors = vec![
            Detector {
                name:    "credit_card",
                pattern: re(r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
                mask:    mask_credit_card,
            },
            Detector {
                name:    "ssn",
                pattern: re(r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b"),
                mask:    |_| "XXX-XX-XXXX".to_string(),
            },
            Detector {
                name:    "email",
                pattern: re(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
                mask:    mask_email,
            },
            Detector {
                name:    "phone",
                pattern: re(r"\b(\+\d{1,2}\s?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"),
                mask:    mask_phone,
            },
            Detector {
                name:    "ip_address",
                pattern: re(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"),
                mask:    |_| "XXX.XXX.XXX.XXX".to_string(),
            },
            Detector {
                name:    "date_of_birth",
                pattern: re(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b"),
                mask:    |_| "XX/XX/XXXX".to_string(),
            },
        ];
        Self { detectors }
    }

    /// Mask every detected PII span; `None` when nothing matched.
    #[must_use]
    pub fn mask_text(&self, text: &str) -> Option<String> {
        let mut current = text.to_string();
        let mut changed = false;

        for detector in &self.detectors {
            if !detector.pattern.is_match(&current) {
                continue;
            }
            current = detector
                .pattern
                .replace_all(&current, |caps: &regex::Captures<'_>| {
                    (detector.mask)(&caps[0])
                })
                .into_owned();
            changed = true;
            tracing::trace!(detector = detector.name, "pii detector matched");
        }

        changed.then_some(current)
    }
}

/// Keep the first six and last four digits.
fn mask_credit_card(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 10 {
        return "X".repeat(digits.len());
    }
    let mut masked: String = digits[..6].iter().collect();
    masked.extend(std::iter::repeat_n('X', digits.len() - 10));
    masked.extend(&digits[digits.len() - 4..]);

    if value.contains('-') {
        format!("{}-{}-{}-{}", &masked[..4], &masked[4..8], &masked[8..12], &masked[12..])
    } else if value.contains(' ') {
        format!("{} {} {} {}", &masked[..4], &masked[4..8], &masked[8..12], &masked[12..])
    } else {
        masked
    }
}

/// Mask the username, keep the domain.
fn mask_email(value: &str) -> String {
    let Some((username, domain)) = value.split_once('@') else {
        return "x".repeat(value.len());
    };
    let chars: Vec<char> = username.chars().collect();
    let masked_user = if chars.len() <= 2 {
        "x".repeat(chars.len())
    } else {
        format!(
            "{}{}{}",
            chars[0],
            "x".repeat(chars.len() - 2),
            chars[chars.len() - 1]
        )
    };
    format!("{masked_user}@{domain}")
}

/// Keep the last two digits.
fn mask_phone(value: &str) -> String {
    value
        .chars()
        .rev()
        .scan(0usize, |digits_seen, c| {
            let out = if c.is_ascii_digit() {
                *digits_seen += 1;
                if *digits_seen <= 2 { c } else { 'X' }
            } else {
                c
            };
            Some(out)
        })
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_card_detection() {
        let detectors = PiiDetectors::new();
        let out = detectors
            .mask_text("card 4111-1111-1111-1234 on file")
            .unwrap();
        assert_eq!(out, "card 4111-11XX-XXXX-1234 on file");
    }

    #[test]
    fn test_email_detection() {
        let detectors = PiiDetectors::new();
        let out = detectors.mask_text("contact alice@example.com now").unwrap();
        assert_eq!(out, "contact axxxe@example.com now");
    }

    #[test]
    fn test_ssn_detection() {
        let detectors = PiiDetectors::new();
        let out = detectors.mask_text("ssn: 123-45-6789").unwrap();
        assert!(out.contains("XXX-XX-XXXX"));
        assert!(!out.contains("123-45-6789"));
    }

    #[test]
    fn test_ip_detection() {
        let detectors = PiiDetectors::new();
        let out = detectors.mask_text("seen from 192.168.1.77").unwrap();
        assert_eq!(out, "seen from XXX.XXX.XXX.XXX");
    }

    #[test]
    fn test_phone_detection_keeps_last_two() {
        let detectors = PiiDetectors::new();
        let out = detectors.mask_text("call (555) 123-4567").unwrap();
        assert!(out.ends_with("67"));
        assert!(!out.contains("123-45"));
    }

    #[test]
    fn test_clean_text_untouched() {
        let detectors = PiiDetectors::new();
        assert!(detectors.mask_text("nothing sensitive here").is_none());
    }

    #[test]
    fn test_multiple_detections_in_one_cell() {
        let detectors = PiiDetectors::new();
        let out = detectors
            .mask_text("bob@corp.example logged in from 10.0.0.5")
            .unwrap();
        assert!(!out.contains("bob@corp.example"));
        assert!(!out.contains("10.0.0.5"));
    }
}
