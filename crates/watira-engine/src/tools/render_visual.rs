use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use watira_core::tools::{ArtifactRef, Tool, ToolContext, ToolError, ToolOutput};

use crate::cache::{Artifact, ArtifactCache};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::render::{RenderError, Renderer, Visual};

/// Renders charts, tables and diagrams into cached image artifacts.
pub struct RenderVisualTool {
    cache: Arc<ArtifactCache>,
    renderer: Arc<dyn Renderer>,
}

impl RenderVisualTool {
    pub fn new(cache: Arc<ArtifactCache>, renderer: Arc<dyn Renderer>) -> Self {
        Self { cache, renderer }
    }
}

#[async_trait]
impl Tool for RenderVisualTool {
    fn name(&self) -> &str {
        "render_visual"
    }

    fn description(&self) -> &str {
        "Render a diagram, bar chart, line chart, pie chart or table as an image. \
         Returns a fingerprint that send_email can attach."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["kind"],
            "properties": {
                "kind": {
                    "type": "string",
                    "enum": ["diagram", "bar_chart", "line_chart", "pie_chart", "table"]
                },
                "title": { "type": "string" },
                "labels": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Category labels (bar, line and pie charts)"
                },
                "values": {
                    "type": "array",
                    "items": { "type": "number" },
                    "description": "One value per label (bar and pie charts)"
                },
                "series": {
                    "type": "array",
                    "description": "Line chart series",
                    "items": {
                        "type": "object",
                        "required": ["name", "values"],
                        "properties": {
                            "name": { "type": "string" },
                            "values": { "type": "array", "items": { "type": "number" } }
                        }
                    }
                },
                "columns": { "type": "array", "items": { "type": "string" } },
                "rows": {
                    "type": "array",
                    "items": { "type": "array", "items": { "type": "string" } }
                },
                "nodes": {
                    "type": "array",
                    "description": "Diagram nodes",
                    "items": {
                        "type": "object",
                        "required": ["id"],
                        "properties": {
                            "id": { "type": "string" },
                            "label": { "type": "string" }
                        }
                    }
                },
                "edges": {
                    "type": "array",
                    "description": "Diagram edges between node ids",
                    "items": {
                        "type": "object",
                        "required": ["from", "to"],
                        "properties": {
                            "from": { "type": "string" },
                            "to": { "type": "string" },
                            "label": { "type": "string" }
                        }
                    }
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let fingerprint_inputs = args.clone();
        let visual: Visual = ToolError::parse_args(args)?;
        visual
            .validate()
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let kind = visual.kind();
        let fp = Fingerprint::of(kind, self.renderer.version(), &fingerprint_inputs);

        let renderer = Arc::clone(&self.renderer);
        let artifact = self
            .cache
            .get_or_compute(&fp, || async move {
                let mime_type = renderer.mime_type().to_string();
                let bytes = tokio::task::spawn_blocking(move || renderer.render(&visual.reshaped()))
                    .await
                    .map_err(|e| CacheError::Compute(format!("renderer crashed: {e}")))?
                    .map_err(|e: RenderError| CacheError::Compute(e.to_string()))?;
                Ok(Artifact::new(kind, mime_type, bytes))
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        debug!(%fp, size = artifact.size(), "visual ready");

        Ok(ToolOutput::json(serde_json::json!({
            "fingerprint": fp.as_str(),
            "kind": kind,
            "mime_type": artifact.mime_type,
            "url": format!("/artifacts/{fp}"),
        }))
        .with_artifact(ArtifactRef {
            fingerprint: fp.to_string(),
            mime_type: artifact.mime_type.clone(),
        }))
    }
}
