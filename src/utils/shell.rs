//! Shell-style word splitting
//!
//! Used for command templates (`--exec "perl -Ilib"`) and plugin arguments.
//! Supports single quotes, double quotes and backslash escapes; no expansion.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),

    #[error("trailing backslash in '{0}'")]
    TrailingEscape(String),
}

/// Split `input` into words the way a POSIX shell would, minus expansion
pub fn split(input: &str) -> Result<Vec<String>, SplitError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(SplitError::UnterminatedQuote(input.to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(SplitError::UnterminatedQuote(input.to_string())),
                        },
                        Some(c) => current.push(c),
                        None => return Err(SplitError::UnterminatedQuote(input.to_string())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(SplitError::TrailingEscape(input.to_string())),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain() {
        assert_eq!(split("perl -Ilib").unwrap(), vec!["perl", "-Ilib"]);
        assert_eq!(split("  ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(
            split(r#"sh -c 'echo "hi"' "a b" c\ d"#).unwrap(),
            vec!["sh", "-c", r#"echo "hi""#, "a b", "c d"]
        );
        assert_eq!(split("''").unwrap(), vec![""]);
    }

    #[test]
    fn test_split_errors() {
        assert!(matches!(split("perl 'oops"), Err(SplitError::UnterminatedQuote(_))));
        assert!(matches!(split("perl \\"), Err(SplitError::TrailingEscape(_))));
    }
}
