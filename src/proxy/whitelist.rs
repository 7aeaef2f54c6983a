//! Structured body field allow-lists (spec section 4.4's param-whitelist
//! check). For each configured field on an endpoint, the field's own
//! *value* must glob-match at least one configured pattern — the globs
//! describe acceptable values (e.g. `gpt-4*`), not acceptable field names.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;

/// A compiled allow-list: per endpoint, per field, a [`GlobSet`] of
/// acceptable values for that field.
pub struct ParamWhitelist {
    by_endpoint: HashMap<String, HashMap<String, GlobSet>>,
}

impl ParamWhitelist {
    /// Compile a whitelist from `endpoint -> { field -> [value glob, ...] }`.
    pub fn compile(raw: &HashMap<String, HashMap<String, Vec<String>>>) -> Result<Self, globset::Error> {
        let mut by_endpoint = HashMap::with_capacity(raw.len());
        for (endpoint, fields) in raw {
            let mut by_field = HashMap::with_capacity(fields.len());
            for (field, patterns) in fields {
                let mut builder = GlobSetBuilder::new();
                for pattern in patterns {
                    builder.add(Glob::new(pattern)?);
                }
                by_field.insert(field.clone(), builder.build()?);
            }
            by_endpoint.insert(endpoint.clone(), by_field);
        }
        Ok(Self { by_endpoint })
    }

    /// Whether every configured field's value on `path` matches one of its
    /// allowed globs. An endpoint with no configured whitelist allows
    /// everything — the whitelist is opt-in per endpoint, not a
    /// default-deny firewall. A configured field absent from the body, or
    /// not a string, is rejected: the whitelist only exists to pin a
    /// field to a known set of values.
    pub fn check(&self, path: &str, body: &serde_json::Value) -> Result<(), String> {
        let Some(fields) = self.matching_endpoint(path) else {
            return Ok(());
        };

        let object = body.as_object();

        for (field, allowed_values) in fields {
            let value = object.and_then(|o| o.get(field)).and_then(|v| v.as_str());
            match value {
                Some(value) if allowed_values.is_match(value) => {}
                Some(value) => {
                    return Err(format!("field \"{field}\" has value \"{value}\" which is not permitted on this endpoint"));
                }
                None => {
                    return Err(format!("field \"{field}\" is required on this endpoint"));
                }
            }
        }
        Ok(())
    }

    fn matching_endpoint(&self, path: &str) -> Option<&HashMap<String, GlobSet>> {
        self.by_endpoint
            .iter()
            .find(|(endpoint, _)| path.starts_with(endpoint.as_str()))
            .map(|(_, fields)| fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn an_endpoint_with_no_configured_whitelist_allows_everything() {
        let whitelist = ParamWhitelist::compile(&HashMap::new()).unwrap();
        assert!(whitelist.check("/v1/chat/completions", &json!({"anything": 1})).is_ok());
    }

    #[test]
    fn a_value_matching_the_configured_glob_is_allowed() {
        let mut fields = HashMap::new();
        fields.insert("model".to_string(), vec!["gpt-4*".to_string()]);
        let mut raw = HashMap::new();
        raw.insert("/v1/chat/completions".to_string(), fields);
        let whitelist = ParamWhitelist::compile(&raw).unwrap();

        assert!(whitelist
            .check("/v1/chat/completions", &json!({"model": "gpt-4-super-expensive", "messages": []}))
            .is_ok());
    }

    #[test]
    fn a_value_not_matching_any_configured_glob_is_rejected() {
        let mut fields = HashMap::new();
        fields.insert("model".to_string(), vec!["gpt-4*".to_string()]);
        let mut raw = HashMap::new();
        raw.insert("/v1/chat/completions".to_string(), fields);
        let whitelist = ParamWhitelist::compile(&raw).unwrap();

        assert!(whitelist.check("/v1/chat/completions", &json!({"model": "llama-3"})).is_err());
    }
}
