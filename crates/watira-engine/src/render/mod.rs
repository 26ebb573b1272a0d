//! Chart and diagram rendering.
//!
//! A [`Visual`] is the validated, typed form of a `render_visual` request.
//! Renderers are synchronous and CPU bound; callers run them on the blocking
//! pool inside an artifact cache computation.

pub mod reshape;
pub mod svg;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub use svg::SvgRenderer;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("invalid visual: {0}")]
    Invalid(String),
    #[error("render failed: {0}")]
    Failed(String),
}

pub trait Renderer: Send + Sync {
    /// Changes whenever output bytes for the same input could change.
    fn version(&self) -> &str;
    fn mime_type(&self) -> &str;
    fn render(&self, visual: &Visual) -> Result<Vec<u8>, RenderError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagramNode {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl DiagramNode {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagramEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Visual {
    Diagram {
        #[serde(default)]
        title: Option<String>,
        nodes: Vec<DiagramNode>,
        #[serde(default)]
        edges: Vec<DiagramEdge>,
    },
    BarChart {
        #[serde(default)]
        title: Option<String>,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    LineChart {
        #[serde(default)]
        title: Option<String>,
        labels: Vec<String>,
        series: Vec<Series>,
    },
    PieChart {
        #[serde(default)]
        title: Option<String>,
        labels: Vec<String>,
        values: Vec<f64>,
    },
    Table {
        #[serde(default)]
        title: Option<String>,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

const MAX_ITEMS: usize = 200;

impl Visual {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Diagram { .. } => "diagram",
            Self::BarChart { .. } => "bar_chart",
            Self::LineChart { .. } => "line_chart",
            Self::PieChart { .. } => "pie_chart",
            Self::Table { .. } => "table",
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Diagram { title, .. }
            | Self::BarChart { title, .. }
            | Self::LineChart { title, .. }
            | Self::PieChart { title, .. }
            | Self::Table { title, .. } => title.as_deref(),
        }
    }

    /// Check structural consistency. Runs before any rendering work.
    pub fn validate(&self) -> Result<(), RenderError> {
        let invalid = |msg: String| Err(RenderError::Invalid(msg));
        match self {
            Self::Diagram { nodes, edges, .. } => {
                if nodes.is_empty() {
                    return invalid("diagram needs at least one node".into());
                }
                if nodes.len() > MAX_ITEMS {
                    return invalid(format!("diagram has more than {MAX_ITEMS} nodes"));
                }
                let mut ids = HashSet::new();
                for node in nodes {
                    if !ids.insert(node.id.as_str()) {
                        return invalid(format!("duplicate node id: {}", node.id));
                    }
                }
                for edge in edges {
                    for end in [&edge.from, &edge.to] {
                        if !ids.contains(end.as_str()) {
                            return invalid(format!("edge references unknown node: {end}"));
                        }
                    }
                }
                Ok(())
            }
            Self::BarChart { labels, values, .. } => {
                check_labelled(labels, values)?;
                Ok(())
            }
            Self::PieChart { labels, values, .. } => {
                check_labelled(labels, values)?;
                if values.iter().any(|v| *v < 0.0) {
                    return invalid("pie chart values must not be negative".into());
                }
                if values.iter().sum::<f64>() <= 0.0 {
                    return invalid("pie chart values must not all be zero".into());
                }
                Ok(())
            }
            Self::LineChart { labels, series, .. } => {
                if series.is_empty() {
                    return invalid("line chart needs at least one series".into());
                }
                for s in series {
                    check_labelled(labels, &s.values)
                        .map_err(|e| RenderError::Invalid(format!("series {}: {e}", s.name)))?;
                }
                Ok(())
            }
            Self::Table { columns, rows, .. } => {
                if columns.is_empty() {
                    return invalid("table needs at least one column".into());
                }
                if rows.len() > MAX_ITEMS {
                    return invalid(format!("table has more than {MAX_ITEMS} rows"));
                }
                if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
                    return invalid(format!(
                        "row {i} has {} cells, expected {}",
                        row.len(),
                        columns.len()
                    ));
                }
                Ok(())
            }
        }
    }

    /// Copy with every user-visible string shaped for display.
    pub fn reshaped(&self) -> Visual {
        let s = |t: &String| reshape::shape_for_display(t);
        let opt = |t: &Option<String>| t.as_ref().map(|t| reshape::shape_for_display(t));
        match self {
            Self::Diagram { title, nodes, edges } => Self::Diagram {
                title: opt(title),
                nodes: nodes
                    .iter()
                    .map(|n| DiagramNode {
                        id: n.id.clone(),
                        label: Some(reshape::shape_for_display(n.display_label())),
                    })
                    .collect(),
                edges: edges
                    .iter()
                    .map(|e| DiagramEdge {
                        from: e.from.clone(),
                        to: e.to.clone(),
                        label: opt(&e.label),
                    })
                    .collect(),
            },
            Self::BarChart { title, labels, values } => Self::BarChart {
                title: opt(title),
                labels: labels.iter().map(s).collect(),
                values: values.clone(),
            },
            Self::LineChart { title, labels, series } => Self::LineChart {
                title: opt(title),
                labels: labels.iter().map(s).collect(),
                series: series
                    .iter()
                    .map(|x| Series {
                        name: s(&x.name),
                        values: x.values.clone(),
                    })
                    .collect(),
            },
            Self::PieChart { title, labels, values } => Self::PieChart {
                title: opt(title),
                labels: labels.iter().map(s).collect(),
                values: values.clone(),
            },
            Self::Table { title, columns, rows } => Self::Table {
                title: opt(title),
                columns: columns.iter().map(s).collect(),
                rows: rows.iter().map(|r| r.iter().map(s).collect()).collect(),
            },
        }
    }
}

fn check_labelled(labels: &[String], values: &[f64]) -> Result<(), RenderError> {
    if labels.is_empty() {
        return Err(RenderError::Invalid("at least one data point is required".into()));
    }
    if labels.len() > MAX_ITEMS {
        return Err(RenderError::Invalid(format!(
            "more than {MAX_ITEMS} data points"
        )));
    }
    if labels.len() != values.len() {
        return Err(RenderError::Invalid(format!(
            "{} labels but {} values",
            labels.len(),
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(RenderError::Invalid("values must be finite numbers".into()));
    }
    Ok(())
}
