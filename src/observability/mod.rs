//! Observability: tracing and metrics around model calls
//!
//! Exports
//! - `MetricRecord::{Counter{name, value}, Histogram{name, value}}`
//! - `MetricsCollector`: any `Service<MetricRecord, Response = ()>`
//! - `TracingLayer`: wraps a `ModelService` in a `model_call` span and logs tokens
//! - `MetricsLayer<C>`: forwards token and call counters to an injected collector
//!
//! Composition
//! - `ServiceBuilder::new().layer(TracingLayer::new()).layer(MetricsLayer::new(collector)).service(provider)`
//!
//! Collector failures are logged and ignored; they never fail a run.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, info_span, warn, Instrument};

use crate::provider::{ModelRequest, ProviderResponse};

pub const MODEL_CALLS: &str = "model_calls";
pub const PROMPT_TOKENS: &str = "prompt_tokens";
pub const COMPLETION_TOKENS: &str = "completion_tokens";
pub const MODEL_LATENCY_MS: &str = "model_latency_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRecord {
    Counter { name: &'static str, value: u64 },
    Histogram { name: &'static str, value: u64 },
}

pub trait MetricsCollector: Service<MetricRecord, Response = (), Error = BoxError> {}
impl<T> MetricsCollector for T where T: Service<MetricRecord, Response = (), Error = BoxError> {}

/// Layer that adds a span and token logging around model calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<ModelRequest> for Tracing<S>
where
    S: Service<ModelRequest, Response = ProviderResponse, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let span = info_span!("model_call", messages = req.messages.len());
        let fut = self.inner.call(req);
        Box::pin(
            async move {
                let started = Instant::now();
                match fut.await {
                    Ok(out) => {
                        info!(
                            prompt = out.prompt_tokens,
                            completion = out.completion_tokens,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "model call finished"
                        );
                        Ok(out)
                    }
                    Err(e) => {
                        warn!(error = %e, "model call failed");
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Layer that translates model responses into metric updates.
#[derive(Debug, Clone)]
pub struct MetricsLayer<C> {
    collector: C,
}

impl<C> MetricsLayer<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics<S, C> {
    inner: S,
    collector: C,
}

impl<S, C> Layer<S> for MetricsLayer<C>
where
    C: Clone,
{
    type Service = Metrics<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Metrics {
            inner,
            collector: self.collector.clone(),
        }
    }
}

async fn emit<C>(collector: &mut C, record: MetricRecord)
where
    C: MetricsCollector,
{
    let result = match ServiceExt::ready(collector).await {
        Ok(ready) => ready.call(record).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(error = %e, "metrics collector rejected a record");
    }
}

impl<S, C> Service<ModelRequest> for Metrics<S, C>
where
    S: Service<ModelRequest, Response = ProviderResponse, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    C: MetricsCollector + Clone + Send + 'static,
    C::Future: Send + 'static,
{
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let mut collector = self.collector.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let started = Instant::now();
            let out = fut.await?;
            let records = [
                MetricRecord::Counter {
                    name: MODEL_CALLS,
                    value: 1,
                },
                MetricRecord::Counter {
                    name: PROMPT_TOKENS,
                    value: out.prompt_tokens as u64,
                },
                MetricRecord::Counter {
                    name: COMPLETION_TOKENS,
                    value: out.completion_tokens as u64,
                },
                MetricRecord::Histogram {
                    name: MODEL_LATENCY_MS,
                    value: started.elapsed().as_millis() as u64,
                },
            ];
            for record in records {
                emit(&mut collector, record).await;
            }
            Ok(out)
        })
    }
}

/// Collector that keeps every record in memory.
///
/// Handy for tests and for printing a summary at the end of a batch.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollector {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl InMemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Sum of every counter with this name.
    pub fn counter(&self, name: &str) -> u64 {
        self.records()
            .iter()
            .filter_map(|r| match r {
                MetricRecord::Counter { name: n, value } if *n == name => Some(*value),
                _ => None,
            })
            .sum()
    }
}

impl Service<MetricRecord> for InMemoryCollector {
    type Response = ();
    type Error = BoxError;
    type Future = std::future::Ready<Result<(), BoxError>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: MetricRecord) -> Self::Future {
        let result = self
            .records
            .lock()
            .map(|mut r| r.push(record))
            .map_err(|_| BoxError::from("metrics store poisoned"));
        std::future::ready(result)
    }
}
