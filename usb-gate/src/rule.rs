//! Syntax check for policy rules.
//!
//! A rule line is `target attr...` where the target decides admission and
//! each attribute is `key value`, `key "quoted value"`, or
//! `key { v1 v2 ... }`. The grammar here matches what the host policy
//! daemon accepts; the admission tool never stores a line the daemon would
//! later reject.

const TARGETS: [&str; 3] = ["allow", "block", "reject"];

const ATTRIBUTE_KEYS: [&str; 8] = [
    "id",
    "serial",
    "name",
    "hash",
    "parent-hash",
    "via-port",
    "with-interface",
    "with-connect-type",
];

/// Returns true when `rule` parses under the policy-rule grammar.
pub fn validate_rule(rule: &str) -> bool {
    let tokens = match tokenize(rule) {
        Some(t) => t,
        None => return false,
    };

    let mut iter = tokens.into_iter();
    match iter.next() {
        Some(Token::Word(target)) if TARGETS.contains(&target.as_str()) => {}
        _ => return false,
    }

    loop {
        match iter.next() {
            None => return true,
            Some(Token::Word(word)) if ATTRIBUTE_KEYS.contains(&word.as_str()) => {}
            Some(_) => return false,
        }

        match iter.next() {
            Some(Token::Word(_)) | Some(Token::Quoted(_)) => {}
            Some(Token::OpenBrace) => {
                let mut saw_value = false;
                loop {
                    match iter.next() {
                        Some(Token::Word(_)) | Some(Token::Quoted(_)) => saw_value = true,
                        Some(Token::CloseBrace) => break,
                        _ => return false,
                    }
                }
                if !saw_value {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    OpenBrace,
    CloseBrace,
}

/// Splits a rule into tokens. Returns None on unterminated quotes or
/// braces glued to other characters.
fn tokenize(rule: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = rule.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ch if ch.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                tokens.push(Token::OpenBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::CloseBrace);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return None,
                        },
                        Some(ch) => value.push(ch),
                        None => return None,
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '{' || ch == '}' || ch == '"' {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    if tokens.is_empty() {
        return None;
    }
    Some(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_basic_allow_rule() {
        assert!(validate_rule("allow id 0781:5588"));
    }

    #[test]
    fn accepts_quoted_values() {
        assert!(validate_rule(
            r#"allow id 0781:5588 serial "0123456789" name "Ultra USB 3.0" hash "X""#
        ));
    }

    #[test]
    fn accepts_interface_sets() {
        assert!(validate_rule(
            "allow id 1d6b:0104 with-interface { 08:06:50 08:06:62 }"
        ));
        assert!(validate_rule("block with-interface { 03:00:01 }"));
    }

    #[test]
    fn rejects_empty_rule() {
        assert!(!validate_rule(""));
        assert!(!validate_rule("   "));
    }

    #[test]
    fn rejects_unknown_target() {
        assert!(!validate_rule("permit id 0781:5588"));
    }

    #[test]
    fn rejects_unknown_attribute() {
        assert!(!validate_rule("allow vendor 0781"));
    }

    #[test]
    fn rejects_missing_value() {
        assert!(!validate_rule("allow id"));
        assert!(!validate_rule("allow id 0781:5588 serial"));
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(!validate_rule(r#"allow name "Ultra"#));
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(!validate_rule("allow with-interface { 08:06:50"));
        assert!(!validate_rule("allow with-interface { }"));
    }

    #[test]
    fn quoted_escape_sequences_parse() {
        assert!(validate_rule(r#"allow name "disk \"A\"""#));
    }
}
