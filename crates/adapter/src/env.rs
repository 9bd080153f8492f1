//! `${VAR}` expansion for config values.

/// Expand `${VAR}` occurrences using the process environment.
///
/// An unterminated `${` is left as-is.
///
/// # Errors
///
/// Returns `Err(...)` naming the variable when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let var_name = &rest[start + 2..start + 2 + len];
        let value = std::env::var(var_name).map_err(|_| {
            format!("Environment variable '{var_name}' not found (referenced in config)")
        })?;
        result.push_str(&rest[..start]);
        result.push_str(&value);
        rest = &rest[start + 2 + len + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

pub mod serde_helpers {
    use super::expand_env_string;
    use serde::{Deserialize, Deserializer};

    /// Deserialize `Option<u64>` that may be written as a `${ENV}` string.
    pub fn deserialize_option_u64_env<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as DeError;

        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected unsigned integer")),
            Some(serde_json::Value::String(s)) => {
                let expanded = expand_env_string(&s).map_err(D::Error::custom)?;
                let expanded = expanded.trim();
                expanded.parse::<u64>().map(Some).map_err(|e| {
                    D::Error::custom(format!("expected unsigned integer, got '{expanded}': {e}"))
                })
            }
            Some(other) => Err(D::Error::custom(format!(
                "expected unsigned integer or string, got {other}"
            ))),
        }
    }

    /// Deserialize `Option<bool>` that may be written as a `${ENV}` string.
    pub fn deserialize_option_bool_env<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as DeError;

        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Bool(b)) => Ok(Some(b)),
            Some(serde_json::Value::String(s)) => {
                let expanded = expand_env_string(&s).map_err(D::Error::custom)?;
                match expanded.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => Ok(Some(true)),
                    "false" | "0" | "no" | "off" => Ok(Some(false)),
                    other => Err(D::Error::custom(format!("expected boolean, got '{other}'"))),
                }
            }
            Some(other) => Err(D::Error::custom(format!(
                "expected boolean or string, got {other}"
            ))),
        }
    }
}
