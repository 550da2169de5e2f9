//! Custom template filters

use minijinja::{Error, ErrorKind, Value};

/// Emit a value as a double-quoted YAML scalar.
///
/// Usage: `{{ value|quote }}`
///
/// A JSON string literal is a valid YAML double-quoted scalar, so quotes,
/// backslashes and line breaks in the value cannot end the scalar early.
pub fn quote(value: Value) -> Result<String, Error> {
    if value.is_undefined() || value.is_none() {
        return Err(Error::new(
            ErrorKind::UndefinedError,
            "cannot quote an undefined value",
        ));
    }
    let text = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    serde_json::to_string(&text).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("failed to quote value: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_string() {
        assert_eq!(quote(Value::from("quay.io/a:1")).unwrap(), "\"quay.io/a:1\"");
    }

    #[test]
    fn test_quote_escapes_quotes_and_newlines() {
        let quoted = quote(Value::from("a\"b\nc")).unwrap();
        assert_eq!(quoted, r#""a\"b\nc""#);

        let parsed: String = serde_yaml::from_str(&quoted).unwrap();
        assert_eq!(parsed, "a\"b\nc");
    }

    #[test]
    fn test_quote_numbers_as_strings() {
        assert_eq!(quote(Value::from(3)).unwrap(), "\"3\"");
    }

    #[test]
    fn test_quote_undefined_fails() {
        let err = quote(Value::UNDEFINED).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedError);
    }
}
