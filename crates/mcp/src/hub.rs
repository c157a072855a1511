//! Owner of every provider connection.

use std::collections::{BTreeMap, HashMap};

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::client::{Client, ClientOptions};
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::schema::{function_name, provider_prefix};

/// Outcome of [`Hub::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Providers that connected and were added.
    pub loaded: Vec<String>,
    /// Providers that were disabled or had nothing to launch.
    pub skipped: Vec<String>,
    /// Providers that failed, with the reason.
    pub failed: Vec<(String, Error)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A named collection of connected providers.
#[derive(Default)]
pub struct Hub {
    clients: BTreeMap<String, Client>,
    options: ClientOptions,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            clients: BTreeMap::new(),
            options,
        }
    }

    /// Launch and connect every enabled provider in `config`, concurrently.
    ///
    /// A failing provider is reported and left out; it never stops the others.
    pub async fn load(&mut self, config: &HubConfig) -> LoadReport {
        let mut report = LoadReport::default();
        let mut attempts = Vec::new();
        let mut prefixes: HashMap<String, String> = self
            .clients
            .keys()
            .map(|name| (provider_prefix(name), name.clone()))
            .collect();

        for (name, provider) in &config.providers {
            if provider.disabled {
                debug!(provider = %name, "provider disabled");
                report.skipped.push(name.clone());
                continue;
            }
            if !provider.is_stdio() {
                warn!(provider = %name, kind = %provider.kind(), "unsupported provider type");
                report.failed.push((
                    name.clone(),
                    Error::Config(format!("unsupported provider type '{}'", provider.kind())),
                ));
                continue;
            }
            if provider.command.trim().is_empty() {
                warn!(provider = %name, "provider has no command");
                report.skipped.push(name.clone());
                continue;
            }
            let prefix = provider_prefix(name);
            match prefixes.get(&prefix) {
                Some(owner) if owner != name => {
                    warn!(
                        provider = %name,
                        other = %owner,
                        %prefix,
                        "function prefix already taken"
                    );
                    report.failed.push((
                        name.clone(),
                        Error::Config(format!(
                            "provider '{name}' shares function prefix '{prefix}' with '{owner}'"
                        )),
                    ));
                    continue;
                }
                _ => {
                    prefixes.insert(prefix, name.clone());
                }
            }

            let client = Client::new(
                name.clone(),
                provider.command.clone(),
                provider.resolved_args(config.base_dir.as_deref()),
                provider.env.clone(),
            )
            .with_options(self.options.clone());

            attempts.push(async move {
                match client.connect().await {
                    Ok(()) => Ok(client),
                    Err(e) => {
                        client.close().await;
                        Err((client.name().to_string(), e))
                    }
                }
            });
        }

        for outcome in join_all(attempts).await {
            match outcome {
                Ok(client) => {
                    let name = client.name().to_string();
                    if let Some(previous) = self.clients.insert(name.clone(), client) {
                        previous.close().await;
                    }
                    report.loaded.push(name);
                }
                Err((name, e)) => {
                    warn!(provider = %name, error = %e, "failed to load provider");
                    report.failed.push((name, e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "providers loaded"
        );
        report
    }

    pub fn get(&self, name: &str) -> Option<&Client> {
        self.clients.get(name)
    }

    /// Names of all connected providers.
    pub fn list(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Provider-prefixed function declarations for every discovered tool.
    pub fn function_declarations(&self) -> Vec<Value> {
        self.clients
            .iter()
            .flat_map(|(name, client)| {
                client
                    .tools()
                    .into_iter()
                    .map(move |tool| tool.to_function_declaration(Some(name.as_str())))
            })
            .collect()
    }

    /// Invoke a tool by its prefixed function name.
    ///
    /// Arguments are coerced to the tool's declared types. A failure reported
    /// by the tool becomes output text (`Error: ...`) rather than an error.
    pub async fn call_function(
        &self,
        function: &str,
        arguments: Map<String, Value>,
    ) -> Result<String> {
        let (client, tool) = self
            .clients
            .iter()
            .find_map(|(name, client)| {
                client
                    .tools()
                    .into_iter()
                    .find(|tool| function_name(name, &tool.name) == function)
                    .map(|tool| (client, tool))
            })
            .ok_or_else(|| Error::ToolNotFound(function.to_string()))?;

        let arguments = tool.coerce_arguments(arguments);
        debug!(provider = %client.name(), tool = %tool.name, "calling tool");
        match client.call_tool(&tool.name, arguments).await {
            Ok(text) => Ok(text),
            Err(Error::ToolCall(message)) => Ok(format!("Error: {message}")),
            Err(e) => Err(e),
        }
    }

    /// Shut down every provider concurrently. Never fails.
    pub async fn dispose_all(&mut self) {
        let clients = std::mem::take(&mut self.clients);
        join_all(clients.values().map(|client| client.close())).await;
        debug!(count = clients.len(), "providers disposed");
    }
}
