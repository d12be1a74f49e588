//! Renders a finished session bundle into a self-contained HTML report
//! and re-ingests `data.json` for the `report` subcommand.

use ccp_core::schema::{InteractionKind, SessionData, SCHEMA_VERSION};
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read data document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse data document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported schemaVersion {found:?}, expected {expected:?}")]
    SchemaVersion { found: String, expected: String },
    #[error("report rendering failed: {0}")]
    Render(String),
}

/// Loads and validates a `data.json`. A schema-version mismatch is
/// refused rather than rendered wrong.
pub fn load_data(path: &Path) -> Result<SessionData, ReportError> {
    let contents = std::fs::read_to_string(path)?;
    let data: SessionData = serde_json::from_str(&contents)?;
    if data.schema_version != SCHEMA_VERSION {
        return Err(ReportError::SchemaVersion {
            found: data.schema_version,
            expected: SCHEMA_VERSION.to_string(),
        });
    }
    Ok(data)
}

/// Renders the bundle as one HTML document. Everything printed is
/// escaped; the bundle itself carries no plaintext, but labels under
/// unsafe modes might.
pub fn render(data: &SessionData) -> Result<String, ReportError> {
    let mut html = String::with_capacity(16 * 1024);
    html.push_str("<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<title>cc-profiler session report</title>\n");
    html.push_str(STYLE);
    html.push_str("</head>\n<body>\n");

    write_summary(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_turns(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_interactions(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_samples(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_markers(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_jsonl(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;
    write_warnings(&mut html, data).map_err(|err| ReportError::Render(err.to_string()))?;

    html.push_str("</body>\n</html>\n");
    Ok(html)
}

const STYLE: &str = "<style>\n\
body{font-family:ui-monospace,monospace;margin:2rem auto;max-width:64rem;color:#222;}\n\
h1{font-size:1.4rem;} h2{font-size:1.1rem;margin-top:2rem;}\n\
table{border-collapse:collapse;width:100%;font-size:0.85rem;}\n\
th,td{border:1px solid #ccc;padding:0.25rem 0.5rem;text-align:right;}\n\
th:first-child,td:first-child{text-align:left;}\n\
.stat{display:inline-block;margin-right:2rem;}\n\
.stat b{display:block;font-size:1.2rem;}\n\
svg{background:#fafafa;border:1px solid #ddd;}\n\
.warn{color:#a40000;}\n\
</style>\n";

fn esc(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn fmt_opt_ms(value: Option<u64>) -> String {
    value
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "—".to_string())
}

fn write_summary(html: &mut String, data: &SessionData) -> std::fmt::Result {
    writeln!(html, "<h1>cc-profiler session report</h1>")?;
    writeln!(
        html,
        "<p>started {} · ended {}</p>",
        esc(&data.started_at_iso),
        esc(data.ended_at_iso.as_deref().unwrap_or("—"))
    )?;

    let turn_interactions: Vec<_> = data
        .interactions
        .iter()
        .filter(|interaction| interaction.kind == InteractionKind::Turn)
        .collect();
    let t1_values: Vec<u64> = turn_interactions
        .iter()
        .filter_map(|interaction| interaction.t1_ms)
        .collect();
    let median_t1 = median(&t1_values);

    writeln!(html, "<div>")?;
    for (label, value) in [
        ("turns", data.turns.len().to_string()),
        ("interactions", data.interactions.len().to_string()),
        ("samples", data.samples.len().to_string()),
        ("markers", data.markers.len().to_string()),
        (
            "median T1",
            median_t1
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "—".to_string()),
        ),
    ] {
        writeln!(
            html,
            "<span class=\"stat\"><b>{}</b>{}</span>",
            esc(&value),
            esc(label)
        )?;
    }
    writeln!(html, "</div>")?;

    if let Some(calibration) = &data.calibration {
        writeln!(
            html,
            "<p>PTY overhead: mean {:.2} ms, p50 {:.2} ms, p95 {:.2} ms over {} samples</p>",
            calibration.mean_ms, calibration.p50_ms, calibration.p95_ms, calibration.samples
        )?;
    }
    writeln!(
        html,
        "<p>host: {} {} · term {}</p>",
        esc(&data.environment.os),
        esc(&data.environment.arch),
        esc(data.environment.term.as_deref().unwrap_or("—"))
    )
}

fn write_turns(html: &mut String, data: &SessionData) -> std::fmt::Result {
    writeln!(html, "<h2>Turns</h2>")?;
    if data.turns.is_empty() {
        return writeln!(html, "<p>No turns detected.</p>");
    }
    writeln!(
        html,
        "<table><tr><th>turn</th><th>t</th><th>source</th><th>T1</th><th>T2</th><th>output bytes</th></tr>"
    )?;
    for turn in &data.turns {
        let interaction = data
            .interactions
            .iter()
            .find(|interaction| interaction.turn_index == Some(turn.index));
        writeln!(
            html,
            "<tr><td>{}</td><td>{} ms</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            turn.index,
            turn.t_ms,
            turn.source.as_str(),
            fmt_opt_ms(interaction.and_then(|interaction| interaction.t1_ms)),
            fmt_opt_ms(interaction.and_then(|interaction| interaction.t2_ms)),
            interaction
                .map(|interaction| interaction.output_bytes.to_string())
                .unwrap_or_else(|| "—".to_string()),
        )?;
    }
    writeln!(html, "</table>")
}

fn write_interactions(html: &mut String, data: &SessionData) -> std::fmt::Result {
    writeln!(html, "<h2>Interactions</h2>")?;
    if data.interactions.is_empty() {
        return writeln!(html, "<p>None recorded.</p>");
    }
    writeln!(
        html,
        "<table><tr><th>id</th><th>kind</th><th>t0</th><th>T1</th><th>T2</th><th>in</th><th>out</th><th>end</th></tr>"
    )?;
    for interaction in &data.interactions {
        writeln!(
            html,
            "<tr><td>{}</td><td>{:?}</td><td>{} ms</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:?}</td></tr>",
            interaction.id,
            interaction.kind,
            interaction.t0_ms,
            fmt_opt_ms(interaction.t1_ms),
            fmt_opt_ms(interaction.t2_ms),
            interaction.input_bytes,
            interaction.output_bytes,
            interaction.end_reason,
        )?;
    }
    writeln!(html, "</table>")
}

/// Inline SVG sparkline over `(t_ms, value)` points.
fn sparkline(points: &[(u64, f64)], width: u32, height: u32) -> String {
    if points.len() < 2 {
        return String::new();
    }
    let t_max = points.last().map(|(t, _)| *t).unwrap_or(1).max(1);
    let v_max = points
        .iter()
        .map(|(_, value)| *value)
        .fold(f64::EPSILON, f64::max);
    let mut path = String::new();
    for (index, (t, value)) in points.iter().enumerate() {
        let x = (*t as f64 / t_max as f64) * f64::from(width);
        let y = f64::from(height) - (value / v_max) * f64::from(height);
        let _ = write!(path, "{}{x:.1},{y:.1} ", if index == 0 { "M" } else { "L" });
    }
    format!(
        "<svg width=\"{width}\" height=\"{height}\" viewBox=\"0 0 {width} {height}\">\
         <path d=\"{path}\" fill=\"none\" stroke=\"#3465a4\" stroke-width=\"1.5\"/></svg>"
    )
}

fn write_samples(html: &mut String, data: &SessionData) -> std::fmt::Result {
    writeln!(html, "<h2>Process samples</h2>")?;
    if data.samples.is_empty() {
        return writeln!(html, "<p>None collected.</p>");
    }
    let cpu_points: Vec<(u64, f64)> = data
        .samples
        .iter()
        .filter_map(|sample| sample.cpu_percent.map(|cpu| (sample.t_ms, cpu)))
        .collect();
    let rss_points: Vec<(u64, f64)> = data
        .samples
        .iter()
        .filter_map(|sample| {
            sample
                .rss_bytes
                .map(|rss| (sample.t_ms, rss as f64 / (1024.0 * 1024.0)))
        })
        .collect();

    let peak_rss = rss_points.iter().map(|(_, mb)| *mb).fold(0.0, f64::max);
    writeln!(
        html,
        "<p>{} samples · peak RSS {:.1} MiB</p>",
        data.samples.len(),
        peak_rss
    )?;
    writeln!(html, "<p>CPU %<br>{}</p>", sparkline(&cpu_points, 640, 60))?;
    writeln!(html, "<p>RSS MiB<br>{}</p>", sparkline(&rss_points, 640, 60))
}

fn write_markers(html: &mut String, data: &SessionData) -> std::fmt::Result {
    if data.markers.is_empty() {
        return Ok(());
    }
    writeln!(html, "<h2>Markers</h2>")?;
    writeln!(html, "<table><tr><th>t</th><th>label</th></tr>")?;
    for marker in &data.markers {
        let label = marker
            .label
            .as_deref()
            .map(esc)
            .or_else(|| {
                marker
                    .label_sha256
                    .as_deref()
                    .map(|hash| format!("sha256:{}", esc(hash)))
            })
            .unwrap_or_else(|| "—".to_string());
        writeln!(html, "<tr><td>{} ms</td><td>{label}</td></tr>", marker.t_ms)?;
    }
    writeln!(html, "</table>")
}

fn write_jsonl(html: &mut String, data: &SessionData) -> std::fmt::Result {
    if !data.jsonl.enabled {
        return Ok(());
    }
    writeln!(html, "<h2>External log</h2>")?;
    match &data.jsonl.path_sha256 {
        Some(hash) => writeln!(html, "<p>selected log sha256:{}</p>", esc(hash))?,
        None => writeln!(html, "<p>no log selected</p>")?,
    }
    if !data.jsonl.size_samples.is_empty() {
        writeln!(
            html,
            "<table><tr><th>turn</th><th>t</th><th>size bytes</th></tr>"
        )?;
        for sample in &data.jsonl.size_samples {
            writeln!(
                html,
                "<tr><td>{}</td><td>{} ms</td><td>{}</td></tr>",
                sample.turn_index, sample.t_ms, sample.size_bytes
            )?;
        }
        writeln!(html, "</table>")?;
    }
    if let Some(correlation) = &data.jsonl.correlation {
        writeln!(
            html,
            "<p>correlation mode {:?} · {} lines · {} parse errors</p>",
            correlation.mode, correlation.parsed_lines, correlation.parse_errors
        )?;
        writeln!(
            html,
            "<table><tr><th>turn</th><th>records</th><th>bytes</th><th>tool uses</th><th>tools</th><th>tokens in</th><th>tokens out</th></tr>"
        )?;
        for stats in &correlation.per_turn {
            writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                stats.turn_index,
                stats.record_count,
                stats.record_bytes,
                stats.tool_use_count,
                esc(&stats.tool_use_names.join(", ")),
                stats
                    .input_token_count
                    .map(|count| count.to_string())
                    .unwrap_or_else(|| "—".to_string()),
                stats
                    .output_token_count
                    .map(|count| count.to_string())
                    .unwrap_or_else(|| "—".to_string()),
            )?;
        }
        writeln!(html, "</table>")?;
    }
    Ok(())
}

fn write_warnings(html: &mut String, data: &SessionData) -> std::fmt::Result {
    if data.warnings.is_empty() {
        return Ok(());
    }
    writeln!(html, "<h2 class=\"warn\">Warnings</h2>")?;
    writeln!(html, "<ul>")?;
    for warning in &data.warnings {
        match &warning.detail {
            Some(detail) => writeln!(
                html,
                "<li class=\"warn\">{} ms — {}: {}</li>",
                warning.t_ms,
                esc(&warning.code),
                esc(detail)
            )?,
            None => writeln!(
                html,
                "<li class=\"warn\">{} ms — {}</li>",
                warning.t_ms,
                esc(&warning.code)
            )?,
        }
    }
    writeln!(html, "</ul>")
}

fn median(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}
