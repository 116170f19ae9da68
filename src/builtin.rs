//! Default tools and handoff targets for customs case review.
//!
//! The tools here are local, deterministic stand-ins for the knowledge base,
//! vector store, document extraction and tariff-code services a deployment
//! would wire in. They exist so the loop can run end to end without network
//! access; replace them with real services through the builder.

use std::sync::Arc;

use crate::registry::AgentDescriptor;
use crate::tool::{tool_fn, ParsedDocument, ToolDef, ToolResult};

pub const SEARCH_LATEST_KNOWLEDGE: &str = "search_latest_knowledge";
pub const VECTOR_STORE_RETRIEVER: &str = "vector_store_retriever";
pub const BATCH_PROCESS_CLIENT_DOCS: &str = "batch_process_client_docs";
pub const LOOKUP_CODE_DETAILS: &str = "lookup_code_details";

pub const DECLARATION_REVIEW: &str = "declaration_review";
pub const REGULATORY_SUSTAINABILITY: &str = "regulatory_sustainability";
pub const SOURCING_LOGISTICS: &str = "sourcing_logistics";

/// Code looked up when the code tool is invoked on its own.
const DEFAULT_CODE: &str = "0101.21";
/// Codes cross-referenced by every knowledge search.
const KNOWLEDGE_CODES: [&str; 3] = ["0101.21", "0202.30", "0303.40"];
/// Client uploads processed by the document batch tool.
const CLIENT_FILES: [&str; 3] = ["file1.pdf", "file2.pdf", "file3.pdf"];

/// Look up one tariff code.
pub fn lookup_code(code: &str) -> Vec<String> {
    vec![format!("HSCode search result for: {code}")]
}

/// Extract the text of one uploaded document.
pub fn extract_text(file: &str) -> String {
    format!("Parsed content of {file}")
}

/// Extract every file, numbering line ranges in blocks of ten.
pub fn process_submissions(files: &[&str]) -> Vec<ParsedDocument> {
    files
        .iter()
        .enumerate()
        .map(|(idx, file)| {
            let base = 10 * idx as u32;
            ParsedDocument::new(extract_text(file), base + 1, base + 5)
        })
        .collect()
}

pub fn search_latest_knowledge() -> ToolDef {
    tool_fn(
        SEARCH_LATEST_KNOWLEDGE,
        "Searches the latest knowledge base for relevant information.",
        |case: Arc<str>| async move {
            let mut lines = vec![format!("Latest knowledge about: {case}")];
            for code in KNOWLEDGE_CODES {
                lines.extend(lookup_code(code));
            }
            Ok(ToolResult::Lines(lines))
        },
    )
}

pub fn vector_store_retriever() -> ToolDef {
    tool_fn(
        VECTOR_STORE_RETRIEVER,
        "Retrieves relevant information from the vector store based on the query.",
        |case: Arc<str>| async move {
            Ok(ToolResult::lines([format!("Vector store result for: {case}")]))
        },
    )
}

pub fn batch_process_client_docs() -> ToolDef {
    tool_fn(
        BATCH_PROCESS_CLIENT_DOCS,
        "Processes and extracts information from all client-uploaded PDF documents.",
        |_case: Arc<str>| async move { Ok(ToolResult::Documents(process_submissions(&CLIENT_FILES))) },
    )
}

pub fn lookup_code_details() -> ToolDef {
    tool_fn(
        LOOKUP_CODE_DETAILS,
        "Looks up details and regulations for a given HS/HTS code.",
        |_case: Arc<str>| async move { Ok(ToolResult::Lines(lookup_code(DEFAULT_CODE))) },
    )
}

/// The four default evidence-gathering tools.
pub fn default_tools() -> Vec<ToolDef> {
    vec![
        search_latest_knowledge(),
        vector_store_retriever(),
        batch_process_client_docs(),
        lookup_code_details(),
    ]
}

/// The three default handoff targets.
pub fn default_agents() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new(
            DECLARATION_REVIEW,
            "Use when product classification is unclear, documentation is incomplete or ambiguous, or multiple HS/HTS codes apply.",
        ),
        AgentDescriptor::new(
            REGULATORY_SUSTAINABILITY,
            "Use when the item may violate import/export laws, require special licenses, or involve ESG, REACH, CBAM, or other regulatory compliance concerns.",
        ),
        AgentDescriptor::new(
            SOURCING_LOGISTICS,
            "Use when everything is in order and the shipment is routine, well-documented, and ready for normal processing.",
        ),
    ]
}
