//! Expansion of `$NAME` / `${NAME}` references against the process
//! environment.
//!
//! Config values (subprocess env blocks, stored secrets) may name process
//! environment variables instead of embedding secrets. Expansion happens at
//! use time; an unresolved reference is an error, never passed through.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvExpandError {
    #[error("environment variable '{name}' referenced by '{value}' is not set")]
    Unresolved { name: String, value: String },

    #[error("unterminated '${{' reference in '{value}'")]
    Unterminated { value: String },
}

/// Expand every `$NAME` and `${NAME}` in `value`.
///
/// `$$` escapes a literal dollar sign. Names are `[A-Za-z0-9_]+`; a `$`
/// followed by anything else is passed through verbatim.
pub fn expand(value: &str) -> Result<String, EnvExpandError> {
    expand_with(value, |name| std::env::var(name).ok())
}

/// Expansion against an arbitrary lookup, for tests.
pub fn expand_with(
    value: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, EnvExpandError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(EnvExpandError::Unterminated {
                                value: value.to_string(),
                            });
                        }
                    }
                }
                out.push_str(&resolve(&name, value, &lookup)?);
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&resolve(&name, value, &lookup)?);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

fn resolve(
    name: &str,
    value: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, EnvExpandError> {
    lookup(name).ok_or_else(|| EnvExpandError::Unresolved {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        match name {
            "HOME_DIR" => Some("/home/u".to_string()),
            "TOKEN" => Some("s3cr3t".to_string()),
            _ => None,
        }
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand_with("no refs here", fake).unwrap(), "no refs here");
    }

    #[test]
    fn both_reference_forms_expand() {
        assert_eq!(expand_with("$TOKEN", fake).unwrap(), "s3cr3t");
        assert_eq!(expand_with("x-${TOKEN}-y", fake).unwrap(), "x-s3cr3t-y");
        assert_eq!(
            expand_with("$HOME_DIR/bin:$TOKEN", fake).unwrap(),
            "/home/u/bin:s3cr3t"
        );
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let err = expand_with("${MISSING}", fake).unwrap_err();
        assert!(err.to_string().contains("MISSING"));
        assert!(expand_with("$MISSING", fake).is_err());
    }

    #[test]
    fn dollar_escapes() {
        assert_eq!(expand_with("cost: $$5", fake).unwrap(), "cost: $5");
        assert_eq!(expand_with("trailing $", fake).unwrap(), "trailing $");
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        assert!(matches!(
            expand_with("${OOPS", fake),
            Err(EnvExpandError::Unterminated { .. })
        ));
    }
}
