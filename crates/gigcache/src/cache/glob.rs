//! Redis-compatible glob patterns.
//!
//! The local backend evaluates invalidation patterns itself, so it has to
//! agree with `SCAN MATCH` on what a pattern means: `*`, `?`, `[...]`
//! (with `^` negation and `a-z` ranges) and `\` escapes. Patterns are
//! translated to an anchored [`Regex`].

use regex::Regex;

const SPECIAL: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Escape a literal so it only ever matches itself inside a pattern.
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    // None when the pattern contains an empty `[]` class and can match nothing
    regex: Option<Regex>,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let Some(source) = translate(pattern) else {
            return Ok(Self { regex: None });
        };
        Ok(Self {
            regex: Some(Regex::new(&source)?),
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(key))
    }
}

fn literal(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0; 4]))
}

/// Regex source for `pattern`, or `None` if it can never match.
fn translate(pattern: &str) -> Option<String> {
    let p: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?s)^");
    let mut i = 0;
    while i < p.len() {
        match p[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < p.len() => {
                i += 1;
                out.push_str(&literal(p[i]));
            }
            '[' => {
                let (class, next) = translate_class(&p, i + 1);
                out.push_str(&class?);
                i = next;
                continue;
            }
            c => out.push_str(&literal(c)),
        }
        i += 1;
    }
    out.push('$');
    Some(out)
}

/// Translate the class body starting at `p[start]`.
/// Returns the regex class (`None` for an empty, non-negated class) and the
/// index just past the closing `]`. An unterminated class runs to the end.
fn translate_class(p: &[char], start: usize) -> (Option<String>, usize) {
    let mut i = start;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut items = String::new();
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            items.push_str(&literal(p[i + 1]));
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            items.push_str(&format!("{}-{}", literal(lo), literal(hi)));
            i += 3;
        } else {
            items.push_str(&literal(p[i]));
            i += 1;
        }
    }
    let next = if i < p.len() { i + 1 } else { i };

    let class = match (items.is_empty(), negate) {
        (true, true) => Some(".".to_string()),
        (true, false) => None,
        (false, true) => Some(format!("[^{items}]")),
        (false, false) => Some(format!("[{items}]")),
    };
    (class, next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        Glob::new(pattern).unwrap().is_match(key)
    }

    #[test]
    fn star_matches_any_suffix() {
        assert!(matches("bookings:*", "bookings:user:u1:role:student:query:{}"));
        assert!(matches("bookings:*", "bookings:"));
        assert!(!matches("bookings:*", "gigs:user:u1"));
    }

    #[test]
    fn star_in_the_middle_backtracks() {
        assert!(matches("a*b*c", "axxbyyc"));
        assert!(matches("a*c", "abcbc"));
        assert!(!matches("a*c", "abcb"));
    }

    #[test]
    fn question_mark_and_classes() {
        assert!(matches("u?", "u1"));
        assert!(!matches("u?", "u12"));
        assert!(matches("u[0-9]", "u7"));
        assert!(matches("u[9-0]", "u7"));
        assert!(!matches("u[^0-9]", "u7"));
        assert!(matches("u[abc]", "ub"));
        assert!(matches("u[a-]", "u-"));
    }

    #[test]
    fn degenerate_classes() {
        assert!(!matches("a[", "a"));
        assert!(!matches("a[", "a["));
        assert!(!matches("[]]", "]"));
        assert!(matches("x[^]", "xy"));
        assert!(matches("u[ab", "ub"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a.b(c)+{d}$", "a.b(c)+{d}$"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("[.]", "."));
        assert!(!matches("[.]", "x"));
    }

    #[test]
    fn escaped_literals_only_match_themselves() {
        let pattern = format!("bookings:user:{}:*", escape("*"));
        assert!(matches(&pattern, "bookings:user:*:role:guest:query:{}"));
        assert!(!matches(&pattern, "bookings:user:u1:role:guest:query:{}"));
    }

    #[test]
    fn user_prefix_does_not_match_longer_ids() {
        let pattern = "bookings:user:u1:*";
        assert!(matches(pattern, "bookings:user:u1:role:student:query:{}"));
        assert!(!matches(pattern, "bookings:user:u10:role:student:query:{}"));
    }

    #[test]
    fn query_json_in_key_is_plain_text() {
        let key = "gigs:user:u1:role:student:query:{\"note\":\"a\nb\"}";
        assert!(matches("gigs:user:u1:role:student:*", key));
    }

    #[test]
    fn escape_covers_all_specials() {
        assert_eq!(escape(r"a*b?c[d]e\f"), r"a\*b\?c\[d\]e\\f");
        assert_eq!(escape("plain"), "plain");
    }
}
