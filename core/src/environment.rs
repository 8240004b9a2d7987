//! Environment resolution.
//!
//! # Design
//! An `Environment` is a single value holding a name, a base address and the
//! headers derived from that address. Nothing in the crate reads a
//! "current environment" from global state; the resolved value is passed into
//! the client explicitly. Address-bound headers (`origin`, `referer`) are
//! computed from the base address and cannot be overridden with another
//! environment's values, so a request can never mix the two.
//!
//! Environments are disjoint item namespaces: the same `disp_id` in `dev` and
//! `production` are unrelated records.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

/// Path of the single RPC endpoint, relative to the base address.
pub const API_PATH: &str = "/api";

/// Names of the environments every deployment has.
pub const DEV: &str = "dev";
pub const LIVEOPS: &str = "liveops";
pub const PRODUCTION: &str = "production";

const ADDRESS_BOUND_HEADERS: [&str; 2] = ["origin", "referer"];

/// A named deployment of the admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    name: String,
    base_url: String,
    origin: String,
    extra_headers: Vec<(String, String)>,
}

impl Environment {
    /// Build an environment from its base address.
    ///
    /// A trailing slash on `base_url` is ignored. Fails with
    /// `InvalidEnvironment` if the address is not an absolute http(s) URL.
    pub fn new(name: &str, base_url: &str) -> ApiResult<Self> {
        let invalid = |reason: String| ApiError::InvalidEnvironment {
            name: name.to_string(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("environment name is empty".to_string()));
        }
        let base_url = base_url.trim_end_matches('/');
        let parsed = Url::parse(base_url).map_err(|e| invalid(format!("bad base address: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme `{}`", parsed.scheme())));
        }
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            origin: parsed.origin().ascii_serialization(),
            extra_headers: Vec::new(),
        })
    }

    /// Add a static header sent with every request to this environment.
    ///
    /// Address-bound headers are derived from the base address; supplying one
    /// that names a different address is rejected.
    pub fn with_header(mut self, key: &str, value: &str) -> ApiResult<Self> {
        let key = key.to_ascii_lowercase();
        if ADDRESS_BOUND_HEADERS.contains(&key.as_str()) {
            let same_origin = value == self.origin
                || value
                    .strip_prefix(self.origin.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if !same_origin {
                return Err(ApiError::InvalidEnvironment {
                    name: self.name.clone(),
                    reason: format!("`{key}: {value}` does not match base address {}", self.base_url),
                });
            }
            // Derived value already covers it.
            return Ok(self);
        }
        self.extra_headers.retain(|(k, _)| *k != key);
        self.extra_headers.push((key, value.to_string()));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full address of the RPC endpoint.
    pub fn api_url(&self) -> String {
        format!("{}{API_PATH}", self.base_url)
    }

    /// Headers required on every RPC call to this environment.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("accept-encoding".to_string(), "identity".to_string()),
            ("origin".to_string(), self.origin.clone()),
            ("referer".to_string(), format!("{}/", self.base_url)),
        ];
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }

    /// Address of an item's thumbnail. Side assets are served statically
    /// and never go through the RPC endpoint.
    pub fn thumbnail_url(&self, disp_id: &str) -> String {
        format!("{}/thumbnails/{disp_id}.png", self.base_url)
    }
}

/// Serialized form of an environment, as found in client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    pub fn build(&self) -> ApiResult<Environment> {
        self.headers
            .iter()
            .try_fold(Environment::new(&self.name, &self.base_url)?, |env, (k, v)| {
                env.with_header(k, v)
            })
    }
}

/// Registry mapping environment names to environments.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentResolver {
    environments: BTreeMap<String, Environment>,
}

impl EnvironmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver holding the three standard environments.
    pub fn standard(dev: &str, liveops: &str, production: &str) -> ApiResult<Self> {
        let mut resolver = Self::new();
        resolver.register(Environment::new(DEV, dev)?);
        resolver.register(Environment::new(LIVEOPS, liveops)?);
        resolver.register(Environment::new(PRODUCTION, production)?);
        Ok(resolver)
    }

    /// Add or replace a named environment.
    pub fn register(&mut self, environment: Environment) {
        self.environments
            .insert(environment.name().to_string(), environment);
    }

    pub fn resolve(&self, name: &str) -> ApiResult<&Environment> {
        self.environments
            .get(name)
            .ok_or_else(|| ApiError::UnknownEnvironment {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EnvironmentResolver {
        EnvironmentResolver::standard(
            "https://dev.admin.test",
            "https://liveops.admin.test",
            "https://admin.test/",
        )
        .unwrap()
    }

    #[test]
    fn resolves_standard_environments() {
        let r = resolver();
        assert_eq!(r.resolve("dev").unwrap().api_url(), "https://dev.admin.test/api");
        assert_eq!(r.resolve("production").unwrap().base_url(), "https://admin.test");
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["dev", "liveops", "production"]);
    }

    #[test]
    fn unknown_environment_fails() {
        let err = resolver().resolve("staging").unwrap_err();
        assert_eq!(err, ApiError::UnknownEnvironment { name: "staging".into() });
    }

    #[test]
    fn custom_environments_can_be_added() {
        let mut r = resolver();
        r.register(Environment::new("staging", "http://localhost:8080").unwrap());
        assert_eq!(r.resolve("staging").unwrap().api_url(), "http://localhost:8080/api");
    }

    #[test]
    fn headers_follow_the_base_address() {
        let r = resolver();
        let headers = r.resolve("liveops").unwrap().headers();
        assert!(headers.contains(&("origin".into(), "https://liveops.admin.test".into())));
        assert!(headers.contains(&("referer".into(), "https://liveops.admin.test/".into())));
        assert!(headers.contains(&("accept-encoding".into(), "identity".into())));
    }

    #[test]
    fn foreign_origin_header_is_rejected() {
        let env = Environment::new("dev", "https://dev.admin.test").unwrap();
        let err = env.with_header("Origin", "https://admin.test").unwrap_err();
        assert!(matches!(err, ApiError::InvalidEnvironment { .. }));
    }

    #[test]
    fn extra_headers_are_appended() {
        let env = Environment::new("dev", "https://dev.admin.test")
            .unwrap()
            .with_header("X-Client", "tools")
            .unwrap();
        assert!(env.headers().contains(&("x-client".into(), "tools".into())));
    }

    #[test]
    fn bad_base_address_is_rejected() {
        assert!(Environment::new("dev", "not a url").is_err());
        assert!(Environment::new("dev", "ftp://admin.test").is_err());
    }

    #[test]
    fn thumbnail_url_is_per_environment() {
        let r = resolver();
        assert_eq!(
            r.resolve("dev").unwrap().thumbnail_url("sword_01"),
            "https://dev.admin.test/thumbnails/sword_01.png"
        );
    }
}
