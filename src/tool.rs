//! Tool service modeling
//!
//! Every tool is a Tower service from [`ToolInvocation`] to [`ToolOutput`].
//! Tools are effectively parameterless: the only input is the rendered case
//! text, which is global to a run.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tower::{util::BoxCloneService, BoxError};

/// Uniform tool invocation passed to routed tool services.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub case_text: Arc<str>,
}

/// Uniform tool output produced by tool services.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub name: String, // same as invocation.name
    pub result: ToolResult,
}

/// What a tool hands back: plain evidence lines, or extracted documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Lines(Vec<String>),
    Documents(Vec<ParsedDocument>),
}

impl ToolResult {
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolResult::Lines(lines.into_iter().map(Into::into).collect())
    }

    /// Compact single-line JSON used when feeding the result back to the model.
    pub fn to_context_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One document extracted by a document-processing tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    #[serde(rename = "PageContent")]
    pub page_content: String,
    #[serde(rename = "Metadata")]
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "Loc")]
    pub loc: DocumentLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLocation {
    #[serde(rename = "Lines")]
    pub lines: LineRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    #[serde(rename = "From")]
    pub from: u32,
    #[serde(rename = "To")]
    pub to: u32,
}

impl ParsedDocument {
    pub fn new(page_content: impl Into<String>, from: u32, to: u32) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: DocumentMetadata {
                loc: DocumentLocation {
                    lines: LineRange { from, to },
                },
            },
        }
    }
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneService<ToolInvocation, ToolOutput, BoxError>;

/// Handler signature accepted by [`ToolDef::from_handler`].
pub type ToolHandler =
    Arc<dyn Fn(Arc<str>) -> BoxFuture<'static, Result<ToolResult, BoxError>> + Send + Sync>;

/// Definition of a tool: registry descriptor + service implementation.
#[derive(Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub service: ToolSvc,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl ToolDef {
    /// Create a tool definition from a handler over the case text.
    pub fn from_handler(name: &'static str, description: &'static str, handler: ToolHandler) -> Self {
        let svc = tower::service_fn(move |inv: ToolInvocation| {
            let handler = handler.clone();
            async move {
                if inv.name != name {
                    return Err::<ToolOutput, BoxError>(
                        format!("routed to wrong tool: expected={}, got={}", name, inv.name).into(),
                    );
                }
                let result = (handler)(inv.case_text).await?;
                Ok(ToolOutput {
                    name: inv.name,
                    result,
                })
            }
        });
        Self {
            name,
            description,
            service: BoxCloneService::new(svc),
        }
    }
}

/// DX sugar: create a tool from an async closure over the case text.
pub fn tool_fn<H, Fut>(name: &'static str, description: &'static str, handler: H) -> ToolDef
where
    H: Fn(Arc<str>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, BoxError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let erased: ToolHandler = Arc::new(move |case_text: Arc<str>| {
        let h = handler.clone();
        Box::pin(async move { (h.as_ref())(case_text).await })
    });
    ToolDef::from_handler(name, description, erased)
}
