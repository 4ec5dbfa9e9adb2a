use crate::SerError;

fn is_var_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn fail(offset: usize, message: impl Into<String>) -> SerError {
    SerError::parse("env-subst", offset, message)
}

/// Expands environment references in `input` using `lookup`.
///
/// Supported forms: `$VAR`, `${VAR}` and `${VAR:-default}`; the default
/// may itself contain references. A backslash escapes the next character.
/// Unset variables expand to nothing (unless a default is given).
pub fn env_subst_with<F>(input: &str, lookup: &F) -> Result<String, SerError>
where
    F: Fn(&str) -> Option<String>,
{
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some(&c) => {
                        out.push(c);
                        i += 1;
                    }
                    None => return Err(fail(i, "unexpected end after backslash")),
                }
            }
            '$' => {
                i += 1;
                match chars.get(i) {
                    Some('{') => {
                        i += 1;
                        let start = i;
                        // variable name runs to '}' or ':'
                        while i < chars.len() && chars[i] != '}' && chars[i] != ':' {
                            i += 1;
                        }
                        if i == chars.len() {
                            return Err(fail(i, "unexpected end inside ${}"));
                        }
                        let name: String = chars[start..i].iter().collect();
                        if chars[i] == '}' {
                            i += 1;
                            match lookup(&name) {
                                Some(v) => out.push_str(&v),
                                None => tracing::debug!(var = %name, "envvar is not set"),
                            }
                        } else {
                            // after ':' only the ":-" operator exists
                            i += 1;
                            if chars.get(i) != Some(&'-') {
                                return Err(fail(
                                    i,
                                    format!(
                                        "invalid substitution operator {}",
                                        chars.get(i).copied().unwrap_or(' ')
                                    ),
                                ));
                            }
                            i += 1;
                            // default value runs to the matching '}'
                            let start = i;
                            let mut depth = 0usize;
                            loop {
                                match chars.get(i) {
                                    None => return Err(fail(i, "unexpected end inside ${}")),
                                    Some('{') => depth += 1,
                                    Some('}') if depth == 0 => break,
                                    Some('}') => depth -= 1,
                                    Some(_) => {}
                                }
                                i += 1;
                            }
                            let default: String = chars[start..i].iter().collect();
                            i += 1;
                            match lookup(&name) {
                                Some(v) => out.push_str(&v),
                                // the default may itself substitute
                                None => out.push_str(&env_subst_with(&default, lookup)?),
                            }
                        }
                    }
                    Some(&c) if is_var_char(c) => {
                        let start = i;
                        while i < chars.len() && is_var_char(chars[i]) {
                            i += 1;
                        }
                        let name: String = chars[start..i].iter().collect();
                        if let Some(v) = lookup(&name) {
                            out.push_str(&v);
                        }
                    }
                    _ => return Err(fail(i, "expected an environment variable name")),
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// [`env_subst_with`] against the process environment.
pub fn env_subst(input: &str) -> Result<String, SerError> {
    env_subst_with(input, &|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HOME" => Some("/home/me".to_string()),
            "PORT" => Some("8080".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn bare_and_braced() {
        assert_eq!(env_subst_with("$HOME/x", &lookup).unwrap(), "/home/me/x");
        assert_eq!(env_subst_with("${HOME}dir", &lookup).unwrap(), "/home/medir");
        assert_eq!(env_subst_with("port=$PORT.", &lookup).unwrap(), "port=8080.");
    }

    #[test]
    fn unset_expands_to_nothing() {
        assert_eq!(env_subst_with("a${NOPE}b", &lookup).unwrap(), "ab");
        assert_eq!(env_subst_with("a$NOPE b", &lookup).unwrap(), "a b");
    }

    #[test]
    fn defaults() {
        assert_eq!(env_subst_with("${NOPE:-fallback}", &lookup).unwrap(), "fallback");
        assert_eq!(env_subst_with("${PORT:-9}", &lookup).unwrap(), "8080");
        // empty-but-set suppresses the default
        assert_eq!(env_subst_with("${EMPTY:-x}", &lookup).unwrap(), "");
    }

    #[test]
    fn nested_default() {
        assert_eq!(env_subst_with("${NOPE:-${PORT}}", &lookup).unwrap(), "8080");
        assert_eq!(env_subst_with("${NOPE:-${ALSO_NOPE:-deep}}", &lookup).unwrap(), "deep");
    }

    #[test]
    fn backslash_escapes() {
        assert_eq!(env_subst_with("\\$HOME", &lookup).unwrap(), "$HOME");
        assert_eq!(env_subst_with("a\\\\b", &lookup).unwrap(), "a\\b");
    }

    #[test]
    fn errors() {
        assert!(env_subst_with("$", &lookup).is_err());
        assert!(env_subst_with("${OOPS", &lookup).is_err());
        assert!(env_subst_with("${X:+y}", &lookup).is_err());
        assert!(env_subst_with("trailing\\", &lookup).is_err());
    }
}
