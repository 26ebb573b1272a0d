use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt::Write as _;

use super::{RenderError, Renderer, Series, Visual};

pub const SVG_RENDERER_VERSION: &str = "svg-1";

const PALETTE: &[&str] = &[
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
    "#9c755f", "#bab0ac",
];
const FONT: &str = "DejaVu Sans, Arial, sans-serif";

const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_BOTTOM: f64 = 70.0;

/// Dependency-free SVG output for every [`Visual`] kind. Text is expected in
/// display order already, so bidi reordering is switched off in the output.
#[derive(Clone, Debug)]
pub struct SvgRenderer {
    width: f64,
    height: f64,
}

impl SvgRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: f64::from(width.max(200)),
            height: f64::from(height.max(150)),
        }
    }
}

impl Default for SvgRenderer {
    fn default() -> Self {
        Self::new(800, 500)
    }
}

impl Renderer for SvgRenderer {
    fn version(&self) -> &str {
        SVG_RENDERER_VERSION
    }

    fn mime_type(&self) -> &str {
        "image/svg+xml"
    }

    fn render(&self, visual: &Visual) -> Result<Vec<u8>, RenderError> {
        visual.validate()?;
        let svg = match visual {
            Visual::BarChart { title, labels, values } => self.bar_chart(title.as_deref(), labels, values),
            Visual::LineChart { title, labels, series } => self.line_chart(title.as_deref(), labels, series),
            Visual::PieChart { title, labels, values } => self.pie_chart(title.as_deref(), labels, values),
            Visual::Table { title, columns, rows } => self.table(title.as_deref(), columns, rows),
            Visual::Diagram { title, nodes, edges } => self.diagram(title.as_deref(), nodes, edges),
        };
        Ok(svg.into_bytes())
    }
}

struct Canvas {
    width: f64,
    height: f64,
    body: String,
}

impl Canvas {
    fn new(width: f64, height: f64, title: Option<&str>) -> Self {
        let mut canvas = Self {
            width,
            height,
            body: String::new(),
        };
        canvas.rect(0.0, 0.0, width, height, "#ffffff", None);
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            canvas.text(width / 2.0, 34.0, title, 20.0, "middle", "#222222");
        }
        canvas
    }

    fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, fill: &str, stroke: Option<&str>) {
        let stroke = stroke
            .map(|s| format!(r#" stroke="{s}" stroke-width="1""#))
            .unwrap_or_default();
        let _ = write!(
            self.body,
            r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{fill}"{stroke}/>"#,
            px(x),
            px(y),
            px(w),
            px(h)
        );
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, stroke: &str, extra: &str) {
        let _ = write!(
            self.body,
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{stroke}" stroke-width="1.5"{extra}/>"#,
            px(x1),
            px(y1),
            px(x2),
            px(y2)
        );
    }

    fn text(&mut self, x: f64, y: f64, content: &str, size: f64, anchor: &str, fill: &str) {
        let _ = write!(
            self.body,
            r#"<text x="{}" y="{}" font-family="{FONT}" font-size="{}" text-anchor="{anchor}" fill="{fill}" style="unicode-bidi:bidi-override;direction:ltr">{}</text>"#,
            px(x),
            px(y),
            px(size),
            escape(content)
        );
    }

    fn finish(self) -> String {
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">{}</svg>"#,
            self.body,
            w = px(self.width),
            h = px(self.height)
        )
    }
}

/// Linear value axis over the plot area.
struct ValueScale {
    min: f64,
    max: f64,
    top: f64,
    bottom: f64,
}

impl ValueScale {
    fn new<'a>(values: impl Iterator<Item = &'a f64>, top: f64, bottom: f64) -> Self {
        let (mut min, mut max) = (0.0_f64, 0.0_f64);
        for v in values {
            min = min.min(*v);
            max = max.max(*v);
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }
        Self { min, max, top, bottom }
    }

    fn y(&self, v: f64) -> f64 {
        self.bottom - (v - self.min) / (self.max - self.min) * (self.bottom - self.top)
    }

    fn draw_axis(&self, canvas: &mut Canvas, left: f64, right: f64) {
        for step in 0..=4 {
            let v = self.min + (self.max - self.min) * f64::from(step) / 4.0;
            let y = self.y(v);
            canvas.line(left, y, right, y, "#e0e0e0", "");
            canvas.text(left - 8.0, y + 4.0, &fmt_num(v), 11.0, "end", "#555555");
        }
        canvas.line(left, self.top, left, self.bottom, "#333333", "");
        let zero = self.y(0.0);
        canvas.line(left, zero, right, zero, "#333333", "");
    }
}

impl SvgRenderer {
    fn plot_area(&self) -> (f64, f64, f64, f64) {
        (
            MARGIN_LEFT,
            self.width - MARGIN_RIGHT,
            MARGIN_TOP,
            self.height - MARGIN_BOTTOM,
        )
    }

    fn bar_chart(&self, title: Option<&str>, labels: &[String], values: &[f64]) -> String {
        let mut canvas = Canvas::new(self.width, self.height, title);
        let (left, right, top, bottom) = self.plot_area();
        let scale = ValueScale::new(values.iter(), top, bottom);
        scale.draw_axis(&mut canvas, left, right);

        let band = (right - left) / values.len() as f64;
        let bar_width = band * 0.7;
        let zero = scale.y(0.0);
        for (i, (label, value)) in labels.iter().zip(values).enumerate() {
            let center = left + band * (i as f64 + 0.5);
            let y = scale.y(*value);
            let color = PALETTE[i % PALETTE.len()];
            canvas.rect(center - bar_width / 2.0, y.min(zero), bar_width, (y - zero).abs(), color, None);
            let value_y = if *value >= 0.0 { y - 6.0 } else { y + 14.0 };
            canvas.text(center, value_y, &fmt_num(*value), 11.0, "middle", "#333333");
            canvas.text(center, bottom + 20.0, label, 12.0, "middle", "#333333");
        }
        canvas.finish()
    }

    fn line_chart(&self, title: Option<&str>, labels: &[String], series: &[Series]) -> String {
        let mut canvas = Canvas::new(self.width, self.height, title);
        let (left, right, top, bottom) = self.plot_area();
        let scale = ValueScale::new(series.iter().flat_map(|s| s.values.iter()), top, bottom);
        scale.draw_axis(&mut canvas, left, right);

        let n = labels.len();
        let x_at = |i: usize| {
            if n == 1 {
                (left + right) / 2.0
            } else {
                left + (right - left) * i as f64 / (n - 1) as f64
            }
        };
        for (i, label) in labels.iter().enumerate() {
            canvas.text(x_at(i), bottom + 20.0, label, 12.0, "middle", "#333333");
        }

        for (k, s) in series.iter().enumerate() {
            let color = PALETTE[k % PALETTE.len()];
            let points: Vec<String> = s
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("{},{}", px(x_at(i)), px(scale.y(*v))))
                .collect();
            let _ = write!(
                canvas.body,
                r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2.5"/>"#,
                points.join(" ")
            );
            for (i, v) in s.values.iter().enumerate() {
                let _ = write!(
                    canvas.body,
                    r#"<circle cx="{}" cy="{}" r="3.5" fill="{color}"/>"#,
                    px(x_at(i)),
                    px(scale.y(*v))
                );
            }
            let legend_y = top + 16.0 * k as f64;
            canvas.rect(right - 120.0, legend_y - 9.0, 10.0, 10.0, color, None);
            canvas.text(right - 104.0, legend_y, &s.name, 11.0, "start", "#333333");
        }
        canvas.finish()
    }

    fn pie_chart(&self, title: Option<&str>, labels: &[String], values: &[f64]) -> String {
        let mut canvas = Canvas::new(self.width, self.height, title);
        let total: f64 = values.iter().sum();
        let cx = self.width * 0.38;
        let cy = self.height / 2.0 + 20.0;
        let r = self.width.min(self.height) * 0.32;

        let mut angle = -PI / 2.0;
        for (i, (label, value)) in labels.iter().zip(values).enumerate() {
            let color = PALETTE[i % PALETTE.len()];
            let fraction = value / total;
            if fraction >= 0.9999 {
                let _ = write!(
                    canvas.body,
                    r#"<circle cx="{}" cy="{}" r="{}" fill="{color}"/>"#,
                    px(cx),
                    px(cy),
                    px(r)
                );
            } else if fraction > 0.0 {
                let end = angle + fraction * 2.0 * PI;
                let large = if fraction > 0.5 { 1 } else { 0 };
                let _ = write!(
                    canvas.body,
                    r##"<path d="M {} {} L {} {} A {r} {r} 0 {large} 1 {} {} Z" fill="{color}" stroke="#ffffff" stroke-width="1"/>"##,
                    px(cx),
                    px(cy),
                    px(cx + r * angle.cos()),
                    px(cy + r * angle.sin()),
                    px(cx + r * end.cos()),
                    px(cy + r * end.sin()),
                    r = px(r)
                );
                angle = end;
            }

            let legend_x = self.width * 0.72;
            let legend_y = MARGIN_TOP + 24.0 * i as f64;
            canvas.rect(legend_x, legend_y - 11.0, 14.0, 14.0, color, None);
            let text = format!("{label} ({}%)", fmt_num(fraction * 100.0));
            canvas.text(legend_x + 22.0, legend_y, &text, 12.0, "start", "#333333");
        }
        canvas.finish()
    }

    fn table(&self, title: Option<&str>, columns: &[String], rows: &[Vec<String>]) -> String {
        const ROW_HEIGHT: f64 = 28.0;
        let height = MARGIN_TOP + ROW_HEIGHT * (rows.len() + 1) as f64 + 20.0;
        let mut canvas = Canvas::new(self.width, height, title);
        let left = 20.0;
        let col_width = (self.width - 2.0 * left) / columns.len() as f64;

        let header_y = MARGIN_TOP;
        canvas.rect(left, header_y, col_width * columns.len() as f64, ROW_HEIGHT, PALETTE[0], None);
        for (c, name) in columns.iter().enumerate() {
            let x = left + col_width * (c as f64 + 0.5);
            canvas.text(x, header_y + 19.0, name, 13.0, "middle", "#ffffff");
        }
        for (r, row) in rows.iter().enumerate() {
            let y = header_y + ROW_HEIGHT * (r + 1) as f64;
            let fill = if r % 2 == 0 { "#f5f7fa" } else { "#ffffff" };
            for (c, cell) in row.iter().enumerate() {
                let x = left + col_width * c as f64;
                canvas.rect(x, y, col_width, ROW_HEIGHT, fill, Some("#d0d7de"));
                canvas.text(x + col_width / 2.0, y + 19.0, cell, 12.0, "middle", "#222222");
            }
        }
        canvas.finish()
    }

    fn diagram(
        &self,
        title: Option<&str>,
        nodes: &[super::DiagramNode],
        edges: &[super::DiagramEdge],
    ) -> String {
        const NODE_W: f64 = 140.0;
        const NODE_H: f64 = 40.0;
        const LAYER_GAP: f64 = 90.0;

        let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id.as_str(), i)).collect();

        // Longest-path layering; the pass bound keeps cycles finite.
        let mut depth = vec![0usize; nodes.len()];
        for _ in 0..nodes.len() {
            let mut changed = false;
            for edge in edges {
                let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) else {
                    continue;
                };
                if from != to && depth[to] < depth[from] + 1 && depth[from] + 1 < nodes.len() {
                    depth[to] = depth[from] + 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let layer_count = depth.iter().max().map_or(1, |d| d + 1);
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); layer_count];
        for (i, d) in depth.iter().enumerate() {
            layers[*d].push(i);
        }
        let widest = layers.iter().map(Vec::len).max().unwrap_or(1) as f64;
        let width = self.width.max(widest * (NODE_W + 20.0) + 40.0);
        let height = self.height.max(MARGIN_TOP + 20.0 + layer_count as f64 * LAYER_GAP);

        let mut positions = vec![(0.0, 0.0); nodes.len()];
        for (d, layer) in layers.iter().enumerate() {
            let slot = width / layer.len() as f64;
            for (k, &i) in layer.iter().enumerate() {
                positions[i] = (slot * (k as f64 + 0.5), MARGIN_TOP + 20.0 + d as f64 * LAYER_GAP);
            }
        }

        let mut canvas = Canvas::new(width, height, title);
        canvas.body.push_str(
            r##"<defs><marker id="arrow" viewBox="0 0 10 10" refX="10" refY="5" markerWidth="8" markerHeight="8" orient="auto-start-reverse"><path d="M 0 0 L 10 5 L 0 10 z" fill="#555555"/></marker></defs>"##,
        );

        for edge in edges {
            let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) else {
                continue;
            };
            if from == to {
                continue;
            }
            let (fx, fy) = positions[from];
            let (tx, ty) = positions[to];
            let (y1, y2) = if ty > fy {
                (fy + NODE_H / 2.0, ty - NODE_H / 2.0)
            } else {
                (fy - NODE_H / 2.0, ty + NODE_H / 2.0)
            };
            canvas.line(fx, y1, tx, y2, "#555555", r#" marker-end="url(#arrow)""#);
            if let Some(label) = edge.label.as_deref().filter(|l| !l.is_empty()) {
                canvas.text((fx + tx) / 2.0 + 6.0, (y1 + y2) / 2.0, label, 11.0, "start", "#555555");
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            let (x, y) = positions[i];
            let _ = write!(
                canvas.body,
                r##"<rect x="{}" y="{}" width="{}" height="{}" rx="8" fill="#dbe9f6" stroke="#4e79a7" stroke-width="1.5"/>"##,
                px(x - NODE_W / 2.0),
                px(y - NODE_H / 2.0),
                px(NODE_W),
                px(NODE_H)
            );
            canvas.text(x, y + 5.0, node.display_label(), 13.0, "middle", "#1f2d3d");
        }
        canvas.finish()
    }
}

/// Coordinates with at most two decimals, no trailing zeros.
fn px(v: f64) -> String {
    let s = format!("{v:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        px(v)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
