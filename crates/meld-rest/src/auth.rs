//! Adapter authentication configuration.
//!
//! Auth is a closed set of schemes tagged by a `type` field. Values may name
//! connection options (resolved when a connection is configured) or
//! environment variables (`$VAR` in connection options, or a bare env-var
//! name for bearer tokens).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::RestError;

/// The closed set of supported auth schemes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    /// Bearer token; the value is resolved against the environment first and
    /// used verbatim when no such variable exists.
    Bearer {
        token: String,
    },
    /// Static header injection.
    Headers(BTreeMap<String, String>),
    /// Static query-parameter injection.
    Params(BTreeMap<String, String>),
}

impl AuthConfig {
    /// Parse the `auth` block of an adapter spec.
    pub fn from_value(value: &Value, adapter: &str) -> Result<Self, RestError> {
        let map = value
            .as_object()
            .ok_or_else(|| RestError::Config(format!("auth for {adapter} must be an object")))?;
        let auth_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::Config(format!("auth for {adapter} missing 'type'")))?;
        let params = map
            .get("params")
            .and_then(Value::as_object)
            .map(string_map)
            .unwrap_or_default();

        match auth_type {
            "NONE" => Ok(AuthConfig::None),
            "BASIC" => Ok(AuthConfig::Basic {
                username: params.get("username").cloned().unwrap_or_default(),
                password: params.get("password").cloned().unwrap_or_default(),
            }),
            "BEARER" => {
                let token = params.get("bearer_token").cloned().ok_or_else(|| {
                    RestError::Config(format!("BEARER auth for {adapter} missing 'bearer_token'"))
                })?;
                Ok(AuthConfig::Bearer { token })
            }
            "HEADERS" => {
                let headers = map.get("headers").and_then(Value::as_object).ok_or_else(|| {
                    RestError::Config(format!("HEADERS auth for {adapter} missing 'headers'"))
                })?;
                Ok(AuthConfig::Headers(string_map(headers)))
            }
            "PARAMS" => {
                let extra = map.get("params").and_then(Value::as_object).ok_or_else(|| {
                    RestError::Config(format!("PARAMS auth for {adapter} missing 'params'"))
                })?;
                Ok(AuthConfig::Params(string_map(extra)))
            }
            other => Err(RestError::Config(format!(
                "unknown auth type '{other}' for {adapter}"
            ))),
        }
    }

    /// Substitute connection options into the auth config. Option values
    /// starting with `$` resolve from the environment first.
    pub fn resolve(&self, options: &BTreeMap<String, String>) -> Result<AuthConfig, RestError> {
        let mut resolved = BTreeMap::new();
        for (key, value) in options {
            let value = match value.strip_prefix('$') {
                Some(var) => std::env::var(var).map_err(|_| {
                    RestError::Config(format!("missing env var '{var}' for auth option '{key}'"))
                })?,
                None => value.clone(),
            };
            resolved.insert(key.clone(), value);
        }
        let take = |key: &str, current: &str| {
            resolved.get(key).cloned().unwrap_or_else(|| current.to_string())
        };
        Ok(match self {
            AuthConfig::None => AuthConfig::None,
            AuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: take("username", username),
                password: take("password", password),
            },
            AuthConfig::Bearer { token } => AuthConfig::Bearer {
                token: take("bearer_token", token),
            },
            AuthConfig::Headers(headers) => AuthConfig::Headers(
                headers
                    .iter()
                    .map(|(k, v)| (k.clone(), take(k, v)))
                    .collect(),
            ),
            AuthConfig::Params(params) => AuthConfig::Params(
                params
                    .iter()
                    .map(|(k, v)| (k.clone(), take(k, v)))
                    .collect(),
            ),
        })
    }

    /// Flatten into request pieces for one scan.
    pub fn prepare(&self) -> PreparedAuth {
        let mut prepared = PreparedAuth::default();
        match self {
            AuthConfig::None => {}
            AuthConfig::Basic { username, password } => {
                prepared.basic = Some((username.clone(), password.clone()));
            }
            AuthConfig::Bearer { token } => {
                let token = std::env::var(token).unwrap_or_else(|_| token.clone());
                prepared
                    .headers
                    .push(("Authorization".to_string(), format!("Bearer {token}")));
            }
            AuthConfig::Headers(headers) => {
                for (k, v) in headers {
                    prepared.headers.push((k.clone(), v.clone()));
                }
            }
            AuthConfig::Params(params) => {
                for (k, v) in params {
                    prepared.params.push((k.clone(), v.clone()));
                }
            }
        }
        prepared
    }
}

fn string_map(map: &serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            (
                k.clone(),
                v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
            )
        })
        .collect()
}

/// Auth applied to each request of one scan.
#[derive(Debug, Clone, Default)]
pub struct PreparedAuth {
    pub headers: Vec<(String, String)>,
    pub basic: Option<(String, String)>,
    pub params: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_basic() {
        let auth = AuthConfig::from_value(
            &json!({"type": "BASIC", "params": {"username": "u", "password": "p"}}),
            "shop",
        )
        .unwrap();
        assert_eq!(
            auth,
            AuthConfig::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            }
        );
        let prepared = auth.prepare();
        assert_eq!(prepared.basic, Some(("u".to_string(), "p".to_string())));
    }

    #[test]
    fn test_parse_headers() {
        let auth = AuthConfig::from_value(
            &json!({"type": "HEADERS", "headers": {"X-Api-Key": "k1"}}),
            "shop",
        )
        .unwrap();
        let prepared = auth.prepare();
        assert_eq!(
            prepared.headers,
            vec![("X-Api-Key".to_string(), "k1".to_string())]
        );
    }

    #[test]
    fn test_parse_params_injection() {
        let auth = AuthConfig::from_value(
            &json!({"type": "PARAMS", "params": {"api_key": "k1"}}),
            "shop",
        )
        .unwrap();
        let prepared = auth.prepare();
        assert_eq!(prepared.params, vec![("api_key".to_string(), "k1".to_string())]);
    }

    #[test]
    fn test_unknown_type_rejected_by_name() {
        let err = AuthConfig::from_value(&json!({"type": "AWS4Auth"}), "shop").unwrap_err();
        assert!(err.to_string().contains("AWS4Auth"));
    }

    #[test]
    fn test_resolve_connection_options() {
        let auth = AuthConfig::from_value(
            &json!({"type": "BASIC", "params": {"username": "USERNAME", "password": "PASSWORD"}}),
            "shop",
        )
        .unwrap();
        let mut opts = BTreeMap::new();
        opts.insert("username".to_string(), "alice".to_string());
        opts.insert("password".to_string(), "s3cret".to_string());
        let resolved = auth.resolve(&opts).unwrap();
        assert_eq!(
            resolved,
            AuthConfig::Basic {
                username: "alice".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_missing_env_var_fails() {
        let auth = AuthConfig::None;
        let mut opts = BTreeMap::new();
        opts.insert(
            "token".to_string(),
            "$MELD_TEST_SURELY_UNSET_VAR".to_string(),
        );
        assert!(auth.resolve(&opts).is_err());
    }
}
