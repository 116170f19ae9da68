//! Tool dispatch and the run-scoped output cache
//!
//! [`ToolRouter`] resolves a name once against the [`ToolRegistry`] and
//! forwards to the matching boxed service. Unknown names answer `Ok(None)`
//! instead of failing, so a model that invents a tool costs nothing but a
//! log line. [`ToolOutputCache`] sits in front of the router and guarantees
//! at most one invocation per tool name per run.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::error::TriageError;
use crate::registry::{ToolDescriptor, ToolLookup, ToolRegistry};
use crate::tool::{ToolDef, ToolInvocation, ToolOutput, ToolResult, ToolSvc};

/// Router service over tools using the registry's name → index table.
#[derive(Clone)]
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    services: Vec<ToolSvc>,
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> (Self, Arc<ToolRegistry>) {
        let mut registry = ToolRegistry::default();
        let mut services: Vec<ToolSvc> = Vec::with_capacity(tools.len());

        for td in tools {
            let index = registry.push(ToolDescriptor {
                name: td.name,
                description: td.description,
            });
            if index == services.len() {
                services.push(td.service);
            } else {
                services[index] = td.service;
            }
        }

        let registry = Arc::new(registry);
        (
            Self {
                registry: registry.clone(),
                services,
            },
            registry,
        )
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = Option<ToolOutput>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness of the selected tool is awaited inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        match self.registry.lookup(&req.name) {
            ToolLookup::Found { index } => {
                let mut svc = self.services[index].clone();
                let req = ToolInvocation {
                    name: req.name.trim().to_string(),
                    ..req
                };
                Box::pin(async move {
                    let out = ServiceExt::ready(&mut svc).await?.call(req).await?;
                    Ok(Some(out))
                })
            }
            ToolLookup::NotFound => {
                warn!(tool = %req.name, "unknown tool requested; skipping");
                Box::pin(async { Ok(None) })
            }
        }
    }
}

/// What happened when a name went through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Already present; the tool was not touched.
    Cached,
    /// Newly executed and stored.
    Invoked,
    /// Not in the registry; nothing stored.
    Unknown,
}

/// Tool name → result, in the order results were first gathered.
///
/// Entries are never overwritten within a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutputCache {
    entries: Vec<(String, ToolResult)>,
    invocations: usize,
}

impl ToolOutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ToolResult> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolResult)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of tool executions performed through this cache.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    /// Dispatch `name` unless a result is already cached.
    ///
    /// A failing tool is fatal for the run and surfaces as
    /// [`TriageError::ToolFailed`].
    pub async fn get_or_dispatch<T>(
        &mut self,
        name: &str,
        tools: &mut T,
        case_text: &Arc<str>,
    ) -> Result<Dispatch, BoxError>
    where
        T: Service<ToolInvocation, Response = Option<ToolOutput>, Error = BoxError>,
    {
        let name = name.trim();
        if self.contains(name) {
            debug!(tool = %name, "tool output cached; not re-invoking");
            return Ok(Dispatch::Cached);
        }

        info!(tool = %name, "dispatching tool");
        let invocation = ToolInvocation {
            name: name.to_string(),
            case_text: case_text.clone(),
        };
        let output = ServiceExt::ready(tools)
            .await?
            .call(invocation)
            .await
            .map_err(|e| {
                BoxError::from(TriageError::ToolFailed {
                    tool: name.to_string(),
                    message: e.to_string(),
                })
            })?;

        match output {
            Some(ToolOutput { result, .. }) => {
                self.invocations += 1;
                self.entries.push((name.to_string(), result));
                Ok(Dispatch::Invoked)
            }
            None => Ok(Dispatch::Unknown),
        }
    }
}

impl Serialize for ToolOutputCache {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
