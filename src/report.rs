use crate::session::SessionRecord;
use crate::snapshot::{GpuSource, Partition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const FILE_PREFIX: &str = "system_report_";
const FILE_EXTENSION: &str = REPORT_FORMAT;

/// Reports are self-contained HTML documents, not PDFs.
pub const REPORT_FORMAT: &str = "html";
pub const REPORT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const PRIMARY: &str = "#3B82F6";
const SECONDARY: &str = "#10B981";
const WARNING: &str = "#F59E0B";
const DANGER: &str = "#EF4444";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid report file name: {0:?}")]
    InvalidArtifactName(String),
    #[error("report not found: {0}")]
    NotFound(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ReportError {
    fn io(path: &Path, source: io::Error) -> Self {
        ReportError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportArtifact {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Turns a finalized session into a document.
pub trait ReportRenderer: Send + Sync {
    fn render(
        &self,
        record: &SessionRecord,
        duration_minutes: u64,
    ) -> Result<ReportArtifact, ReportError>;
}

pub fn artifact_file_name(at: DateTime<Utc>) -> String {
    format!("{FILE_PREFIX}{}.{FILE_EXTENSION}", at.format("%Y%m%d_%H%M%S"))
}

/// Rejects anything that could escape the reports directory. Runs before any
/// filesystem access.
pub fn validate_artifact_name(name: &str) -> Result<(), ReportError> {
    let invalid = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
        || Path::new(name).is_absolute();
    if invalid {
        return Err(ReportError::InvalidArtifactName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub filename: String,
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
}

/// The directory reports are written to and served from.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Newest first. A directory that does not exist yet holds no reports.
    pub fn list(&self) -> Result<Vec<ReportEntry>, ReportError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ReportError::io(&self.dir, err)),
        };

        let mut reports = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(FILE_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            reports.push(ReportEntry {
                filename,
                size_bytes: meta.len(),
                created,
            });
        }
        reports.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(reports)
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, ReportError> {
        validate_artifact_name(name)?;
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(ReportError::NotFound(name.to_string()));
        }
        Ok(path)
    }
}

/// Writes a self-contained HTML page with inline SVG charts.
pub struct HtmlReportRenderer {
    store: ReportStore,
}

impl HtmlReportRenderer {
    pub fn new(store: ReportStore) -> Self {
        Self { store }
    }
}

impl ReportRenderer for HtmlReportRenderer {
    fn render(
        &self,
        record: &SessionRecord,
        duration_minutes: u64,
    ) -> Result<ReportArtifact, ReportError> {
        let dir = self.store.dir();
        fs::create_dir_all(dir).map_err(|err| ReportError::io(dir, err))?;

        let generated = record.finalized_at.unwrap_or_else(Utc::now);
        let filename = artifact_file_name(generated);
        let path = dir.join(&filename);
        let html = render_html(record, generated, duration_minutes);
        fs::write(&path, html.as_bytes()).map_err(|err| ReportError::io(&path, err))?;

        Ok(ReportArtifact {
            filename,
            size_bytes: html.len() as u64,
            path,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl SeriesStats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self { min, max, avg })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Normal,
    Warning,
    Critical,
}

impl Level {
    pub fn classify(value: f64, warning: f64, critical: f64) -> Self {
        if value >= critical {
            Level::Critical
        } else if value >= warning {
            Level::Warning
        } else {
            Level::Normal
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Level::Normal => "Normal",
            Level::Warning => "Warning",
            Level::Critical => "Critical",
        }
    }

    fn color(&self) -> &'static str {
        match self {
            Level::Normal => PRIMARY,
            Level::Warning => WARNING,
            Level::Critical => DANGER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub metric: &'static str,
    pub stats: SeriesStats,
    pub level: Level,
}

/// Min/max/average per utilization series, classified on the average.
pub fn summary_rows(record: &SessionRecord) -> Vec<SummaryRow> {
    [
        ("CPU Usage (%)", &record.cpu_percent, 60.0, 85.0),
        ("Memory Usage (%)", &record.memory_percent, 70.0, 90.0),
        ("GPU Usage (%)", &record.gpu_load, 70.0, 90.0),
    ]
    .into_iter()
    .filter_map(|(metric, values, warning, critical)| {
        let stats = SeriesStats::of(values)?;
        Some(SummaryRow {
            metric,
            stats,
            level: Level::classify(stats.avg, warning, critical),
        })
    })
    .collect()
}

fn render_html(record: &SessionRecord, generated: DateTime<Utc>, duration_minutes: u64) -> String {
    let duration = humantime::format_duration(Duration::from_secs(duration_minutes * 60));
    let mut out = String::with_capacity(32 * 1024);

    out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"generator\" content=\"sysreportd (HTML report)\">\n");
    out.push_str("<title>System Resource Monitoring Report</title>\n");
    out.push_str(STYLE);
    out.push_str("</head>\n<body>\n<h1>System Resource Monitoring Report</h1>\n");
    out.push_str(&format!(
        "<p class=\"meta\">Generated: {} | Started: {} | Duration: {} | Data points: {}</p>\n",
        generated.format("%Y-%m-%d %H:%M:%S UTC"),
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        duration,
        record.data_points(),
    ));

    let rows = summary_rows(record);
    if !rows.is_empty() {
        out.push_str("<h2>Summary Statistics</h2>\n<table>\n");
        out.push_str("<tr><th>Metric</th><th>Min</th><th>Max</th><th>Average</th><th>Status</th></tr>\n");
        for row in &rows {
            out.push_str(&format!(
                "<tr><td>{}</td><td>{:.1}</td><td>{:.1}</td><td>{:.1}</td><td style=\"color:{}\">{}</td></tr>\n",
                row.metric,
                row.stats.min,
                row.stats.max,
                row.stats.avg,
                row.level.color(),
                row.level.label(),
            ));
        }
        out.push_str("</table>\n");
    }
    if record.gpu_source == GpuSource::DisplayAdapter {
        out.push_str(
            "<p class=\"note\">GPU figures come from display-adapter enumeration, which does not \
             expose load or temperature. Zero values there do not mean the GPU was idle.</p>\n",
        );
    }

    if !record.cpu_percent.is_empty() {
        out.push_str("<h2>CPU Usage Over Time</h2>\n");
        out.push_str(&line_chart(
            "Usage (%)",
            &[Series::new("CPU", PRIMARY, &record.cpu_percent)],
            Some(100.0),
        ));
    }
    if !record.memory_percent.is_empty() {
        out.push_str("<h2>Memory Usage Over Time</h2>\n");
        out.push_str(&line_chart(
            "Usage (%)",
            &[Series::new("Memory", SECONDARY, &record.memory_percent)],
            Some(100.0),
        ));
    }
    if !record.network_upload_kbps.is_empty() || !record.network_download_kbps.is_empty() {
        out.push_str("<h2>Network Traffic Over Time</h2>\n");
        out.push_str(&line_chart(
            "Speed (KB/s)",
            &[
                Series::new("Upload", PRIMARY, &record.network_upload_kbps),
                Series::new("Download", SECONDARY, &record.network_download_kbps),
            ],
            None,
        ));
    }

    let temps: Vec<(&str, SeriesStats)> = [
        ("CPU Temperature (°C)", &record.cpu_temp),
        ("GPU Temperature (°C)", &record.gpu_temp),
    ]
    .into_iter()
    .filter_map(|(label, values)| SeriesStats::of(values).map(|s| (label, s)))
    .collect();
    if !temps.is_empty() {
        out.push_str("<h2>Temperature</h2>\n<table>\n");
        out.push_str("<tr><th>Sensor</th><th>Min</th><th>Max</th><th>Average</th></tr>\n");
        for (label, stats) in temps {
            out.push_str(&format!(
                "<tr><td>{label}</td><td>{:.1}</td><td>{:.1}</td><td>{:.1}</td></tr>\n",
                stats.min, stats.max, stats.avg,
            ));
        }
        out.push_str("</table>\n");
    }

    if !record.disk_snapshot.is_empty() {
        out.push_str("<h2>Disk Usage</h2>\n");
        out.push_str(&disk_bar_chart(&record.disk_snapshot));
    }

    if let Some(info) = &record.system_info {
        out.push_str("<h2>System Information</h2>\n<table>\n");
        out.push_str("<tr><th>Property</th><th>Value</th></tr>\n");
        for (label, value) in info.rows() {
            out.push_str(&format!(
                "<tr><td>{label}</td><td>{}</td></tr>\n",
                escape(&value)
            ));
        }
        out.push_str("</table>\n");
    }

    out.push_str("</body>\n</html>\n");
    out
}

const STYLE: &str = "<style>\n\
body{font-family:Helvetica,Arial,sans-serif;color:#1F2937;max-width:860px;margin:24px auto;padding:0 16px}\n\
h1{color:#1F2937}h2{color:#3B82F6;margin-top:28px}\n\
.meta{color:#6B7280}.note{color:#92400E;background:#FEF3C7;padding:8px}\n\
table{border-collapse:collapse;width:100%}\n\
th{background:#3B82F6;color:#fff;padding:8px}td{background:#F9FAFB;padding:6px;border:1px solid #E5E7EB;text-align:center}\n\
svg{background:#F9FAFB}\n\
</style>\n";

const CHART_WIDTH: f64 = 760.0;
const CHART_HEIGHT: f64 = 260.0;
const PAD_LEFT: f64 = 56.0;
const PAD_RIGHT: f64 = 16.0;
const PAD_TOP: f64 = 24.0;
const PAD_BOTTOM: f64 = 48.0;

struct Series<'a> {
    label: &'a str,
    color: &'a str,
    values: &'a [f64],
}

impl<'a> Series<'a> {
    fn new(label: &'a str, color: &'a str, values: &'a [f64]) -> Self {
        Self {
            label,
            color,
            values,
        }
    }
}

fn svg_open() -> String {
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{CHART_WIDTH}\" height=\"{CHART_HEIGHT}\" viewBox=\"0 0 {CHART_WIDTH} {CHART_HEIGHT}\">\n"
    )
}

fn y_axis(out: &mut String, y_label: &str, y_max: f64) {
    let plot_h = CHART_HEIGHT - PAD_TOP - PAD_BOTTOM;
    for step in 0..=4 {
        let value = y_max * step as f64 / 4.0;
        let y = PAD_TOP + plot_h - plot_h * step as f64 / 4.0;
        out.push_str(&format!(
            "<line x1=\"{PAD_LEFT}\" y1=\"{y:.1}\" x2=\"{:.1}\" y2=\"{y:.1}\" stroke=\"#E5E7EB\"/>\n\
             <text x=\"{:.1}\" y=\"{:.1}\" font-size=\"10\" text-anchor=\"end\" fill=\"#6B7280\">{value:.0}</text>\n",
            CHART_WIDTH - PAD_RIGHT,
            PAD_LEFT - 6.0,
            y + 3.0,
        ));
    }
    out.push_str(&format!(
        "<text x=\"12\" y=\"{:.1}\" font-size=\"10\" fill=\"#6B7280\" transform=\"rotate(-90 12 {:.1})\" text-anchor=\"middle\">{}</text>\n",
        PAD_TOP + plot_h / 2.0,
        PAD_TOP + plot_h / 2.0,
        escape(y_label),
    ));
}

fn line_chart(y_label: &str, series: &[Series<'_>], fixed_max: Option<f64>) -> String {
    let observed = series
        .iter()
        .flat_map(|s| s.values.iter().copied())
        .fold(0.0_f64, f64::max);
    let y_max = fixed_max.unwrap_or((observed * 1.1).max(1.0));
    let plot_w = CHART_WIDTH - PAD_LEFT - PAD_RIGHT;
    let plot_h = CHART_HEIGHT - PAD_TOP - PAD_BOTTOM;

    let mut out = svg_open();
    y_axis(&mut out, y_label, y_max);

    for s in series {
        let steps = s.values.len().saturating_sub(1).max(1) as f64;
        let points: Vec<String> = s
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let x = PAD_LEFT + plot_w * i as f64 / steps;
                let y = PAD_TOP + plot_h - plot_h * (v.clamp(0.0, y_max) / y_max);
                format!("{x:.1},{y:.1}")
            })
            .collect();
        out.push_str(&format!(
            "<polyline fill=\"none\" stroke=\"{}\" stroke-width=\"2\" points=\"{}\"/>\n",
            s.color,
            points.join(" "),
        ));
    }

    if series.len() > 1 {
        for (i, s) in series.iter().enumerate() {
            let x = PAD_LEFT + 10.0 + i as f64 * 110.0;
            let y = CHART_HEIGHT - 14.0;
            out.push_str(&format!(
                "<rect x=\"{x:.1}\" y=\"{:.1}\" width=\"12\" height=\"4\" fill=\"{}\"/>\
                 <text x=\"{:.1}\" y=\"{y:.1}\" font-size=\"11\">{}</text>\n",
                y - 4.0,
                s.color,
                x + 16.0,
                escape(s.label),
            ));
        }
    }

    out.push_str("</svg>\n");
    out
}

fn disk_bar_chart(partitions: &[Partition]) -> String {
    let plot_w = CHART_WIDTH - PAD_LEFT - PAD_RIGHT;
    let plot_h = CHART_HEIGHT - PAD_TOP - PAD_BOTTOM;
    let slot = plot_w / partitions.len() as f64;
    let bar_w = slot * 0.6;

    let mut out = svg_open();
    y_axis(&mut out, "Usage (%)", 100.0);
    for (i, p) in partitions.iter().enumerate() {
        let percent = p.percent.clamp(0.0, 100.0);
        let h = plot_h * percent / 100.0;
        let x = PAD_LEFT + slot * i as f64 + (slot - bar_w) / 2.0;
        let y = PAD_TOP + plot_h - h;
        let color = Level::classify(p.percent, 70.0, 90.0).color();
        out.push_str(&format!(
            "<rect x=\"{x:.1}\" y=\"{y:.1}\" width=\"{bar_w:.1}\" height=\"{h:.1}\" fill=\"{color}\"/>\n\
             <text x=\"{:.1}\" y=\"{:.1}\" font-size=\"10\" text-anchor=\"middle\">{:.1}%</text>\n\
             <text x=\"{:.1}\" y=\"{:.1}\" font-size=\"10\" text-anchor=\"middle\">{}</text>\n",
            x + bar_w / 2.0,
            y - 4.0,
            p.percent,
            x + bar_w / 2.0,
            PAD_TOP + plot_h + 16.0,
            escape(&p.mountpoint),
        ));
    }
    out.push_str("</svg>\n");
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::inventory::SystemInfo;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record() -> SessionRecord {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SessionRecord {
            started_at: start,
            cpu_percent: vec![10.0, 70.0, 100.0],
            memory_percent: vec![50.0, 50.0, 50.0],
            gpu_load: Vec::new(),
            cpu_temp: vec![40.0, 60.0],
            gpu_temp: Vec::new(),
            network_upload_kbps: vec![1.0, 2.0, 3.0],
            network_download_kbps: vec![4.0, 5.0, 6.0],
            timestamps: Vec::new(),
            gpu_source: GpuSource::None,
            disk_snapshot: vec![Partition {
                device: "/dev/sda1".to_string(),
                mountpoint: "/<root>".to_string(),
                fstype: "ext4".to_string(),
                total_gb: 100.0,
                used_gb: 95.0,
                free_gb: 5.0,
                percent: 95.0,
            }],
            system_info: Some(SystemInfo {
                platform: "Linux".to_string(),
                ..SystemInfo::default()
            }),
            finalized_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap()),
            finalize_reason: None,
        }
    }

    #[test]
    fn file_name_follows_utc_pattern() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(artifact_file_name(at), "system_report_20240309_140507.html");
    }

    #[test]
    fn artifact_name_validation() {
        assert!(validate_artifact_name("system_report_20240101_000000.pdf").is_ok());
        assert!(validate_artifact_name("system_report_20240101_000000.html").is_ok());
        for bad in ["../../etc/passwd", "a/b.pdf", "a\\b.pdf", "..", "", "/etc/passwd"] {
            assert!(
                matches!(
                    validate_artifact_name(bad),
                    Err(ReportError::InvalidArtifactName(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn summary_uses_average_thresholds() {
        let rows = summary_rows(&record());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric, "CPU Usage (%)");
        assert_eq!(rows[0].stats.min, 10.0);
        assert_eq!(rows[0].stats.max, 100.0);
        assert_eq!(rows[0].stats.avg, 60.0);
        assert_eq!(rows[0].level, Level::Warning);
        assert_eq!(rows[1].level, Level::Normal);
    }

    #[test]
    fn level_boundaries_are_inclusive() {
        assert_eq!(Level::classify(59.9, 60.0, 85.0), Level::Normal);
        assert_eq!(Level::classify(60.0, 60.0, 85.0), Level::Warning);
        assert_eq!(Level::classify(85.0, 60.0, 85.0), Level::Critical);
    }

    #[test]
    fn renders_into_created_directory() {
        let tmp = TempDir::new().unwrap();
        let store = ReportStore::new(tmp.path().join("nested/reports"));
        let renderer = HtmlReportRenderer::new(store.clone());

        let artifact = renderer.render(&record(), 5).unwrap();
        assert_eq!(artifact.filename, "system_report_20240101_000500.html");
        assert!(artifact.path.is_file());

        let html = fs::read_to_string(&artifact.path).unwrap();
        assert!(html.contains("Summary Statistics"));
        assert!(html.contains("Duration: 5m"));
        assert!(html.contains("<polyline"));
        assert!(html.contains("CPU Temperature"));
        assert!(!html.contains("GPU Temperature"));
        assert!(html.contains(DANGER));
        assert!(html.contains("/&lt;root&gt;"));
        assert!(html.contains("System Information"));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, artifact.filename);
        assert_eq!(listed[0].size_bytes, artifact.size_bytes);
    }

    #[test]
    fn unwritable_directory_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let renderer = HtmlReportRenderer::new(ReportStore::new(blocker.join("reports")));
        assert!(matches!(
            renderer.render(&record(), 5),
            Err(ReportError::Io { .. })
        ));
    }

    #[test]
    fn listing_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let store = ReportStore::new(tmp.path());
        assert!(store.list().unwrap().is_empty());

        fs::write(tmp.path().join("system_report_20240101_000000.html"), b"a").unwrap();
        fs::write(tmp.path().join("system_report_20240102_000000.html"), b"bb").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(tmp.path().join("system_report_dir")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created >= listed[1].created);
    }

    #[test]
    fn missing_directory_lists_empty() {
        let tmp = TempDir::new().unwrap();
        let store = ReportStore::new(tmp.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn resolve_validates_before_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let store = ReportStore::new(tmp.path());
        fs::write(tmp.path().join("system_report_20240101_000000.html"), b"a").unwrap();

        assert!(store.resolve("system_report_20240101_000000.html").is_ok());
        assert!(matches!(
            store.resolve("../secret"),
            Err(ReportError::InvalidArtifactName(_))
        ));
        assert!(matches!(
            store.resolve("system_report_20990101_000000.html"),
            Err(ReportError::NotFound(_))
        ));
    }
}
