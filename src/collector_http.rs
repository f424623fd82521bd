//! HTTP collector.
//!
//! Fetches one URL per invocation and returns the body as a payload of the
//! component's declared kind.
//!
//! # Configuration
//!
//! ```toml
//! [collectors.positions]
//! implementation = "http"
//! data_type = "json"
//! schedule = "30s"
//! url = "https://api.example.com/v2/positions?key=${OPERATOR_API_KEY}"
//! timeout_secs = 20
//! headers = { Authorization = "Bearer ${OPERATOR_TOKEN}" }
//! ```
//!
//! `${VAR}` in the URL and in header values is replaced by the environment
//! variable of that name when the collector runs, so secrets can live in
//! the environment or a `.env` file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use mobility_harvester_core::component::Collector;
use mobility_harvester_core::models::{Payload, PayloadKind};

use crate::config::ComponentSpec;

fn default_timeout() -> u64 {
    30
}

pub struct HttpCollector {
    name: String,
    kind: PayloadKind,
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpCollector {
    pub fn from_spec(spec: &ComponentSpec) -> Result<Self> {
        let url = spec
            .setting_str("url")
            .context("the http collector needs a 'url' setting")?
            .to_string();

        let timeout_secs = match spec.settings.get("timeout_secs") {
            None => default_timeout(),
            Some(value) => value
                .as_integer()
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| *v > 0)
                .context("timeout_secs must be a positive integer")?,
        };

        let mut headers = BTreeMap::new();
        if let Some(value) = spec.settings.get("headers") {
            let table = value
                .as_table()
                .context("headers must be a table of strings")?;
            for (name, value) in table {
                let value = value
                    .as_str()
                    .with_context(|| format!("header '{}' must be a string", name))?;
                headers.insert(name.clone(), value.to_string());
            }
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("mobility-harvester/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            name: spec.name.clone(),
            kind: spec.kind,
            url,
            headers,
            client,
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn run(&self) -> Result<Payload> {
        let url = expand_env(&self.url)?;
        let mut request = self.client.get(&url);
        for (name, value) in &self.headers {
            request = request.header(name, expand_env(value)?);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{}: request failed", self.name))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{}: source answered {}", self.name, status);
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("{}: failed to read response body", self.name))?;
        Ok(Payload::decode(self.kind, &body)?)
    }
}

/// Replace every `${VAR}` with the value of the environment variable.
pub fn expand_env(input: &str) -> Result<String> {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .with_context(|| format!("unterminated '${{' in '{}'", input))?;
        let name = &after[..end];
        if name.is_empty() {
            bail!("empty variable name in '{}'", input);
        }
        let value =
            lookup(name).with_context(|| format!("environment variable {} is not set", name))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
