//! Subject filters: shell-glob patterns compiled to regular expressions.

use regex::Regex;

use crate::errors::HeraldError;

/// A compiled, case-insensitive subject filter.
///
/// `*` matches any run of characters (including `/`), `?` a single
/// character, `[...]` / `[!...]` a character class. Everything else is
/// literal.
#[derive(Debug, Clone)]
pub struct SubjectFilter {
    pattern: String,
    regex: Regex,
}

impl SubjectFilter {
    pub fn new(pattern: &str) -> Result<Self, HeraldError> {
        let regex = Regex::new(&translate(pattern))
            .map_err(|e| HeraldError::InvalidFilter(format!("{pattern}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, subject: &str) -> bool {
        self.regex.is_match(subject)
    }
}

impl PartialEq for SubjectFilter {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for SubjectFilter {}

/// Translates a shell glob to an anchored case-insensitive regex.
fn translate(glob: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                // Find the closing bracket; a ']' directly after the opening
                // (or after '!') belongs to the class body. An unterminated
                // class is taken literally.
                let rest: Vec<char> = chars.clone().collect();
                let mut skip = 0;
                if rest.first() == Some(&'!') {
                    skip = 1;
                }
                if rest.get(skip) == Some(&']') {
                    skip += 1;
                }
                match rest[skip..].iter().position(|&c| c == ']').map(|p| p + skip) {
                    Some(end) => {
                        let mut body: String = rest[..end].iter().collect();
                        if let Some(stripped) = body.strip_prefix('!') {
                            body = format!("^{stripped}");
                        }
                        out.push('[');
                        out.push_str(&body.replace('\\', r"\\"));
                        out.push(']');
                        for _ in 0..=end {
                            chars.next();
                        }
                    }
                    None => out.push_str(&regex::escape("[")),
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}
