// HTML report document
//
// Builds a self-contained page: series and labels are embedded as literals so
// the page draws its three charts without any further data access. Chart
// animation is off and `window.reportReady` is set once every chart exists,
// which is what the renderer waits for.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use super::{ReportData, CHART_IDS};
use crate::storage::{timestamp, MetricPoint};

const CHART_JS: &str = "https://cdn.jsdelivr.net/npm/chart.js@4.4.1/dist/chart.umd.min.js";

const CHART_WIDTH: u32 = 800;
const CHART_HEIGHT: u32 = 400;

const STYLE: &str = "\
body { font-family: Arial, sans-serif; margin: 20px; color: #222; }
h1, h2 { color: #333; }
.chart-container { margin-bottom: 30px; width: 800px; }
table { border-collapse: collapse; width: 100%; margin-bottom: 20px; }
th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }
th { background-color: #f2f2f2; }
tr:nth-child(even) { background-color: #f9f9f9; }
.empty { color: #888; font-style: italic; }";

/// Escapes text for HTML element content and attribute values
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Serializes a value for embedding inside a `<script>` element
fn script_literal<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

/// Clock-time labels of a series
fn time_labels(points: &[MetricPoint]) -> Vec<String> {
    points
        .iter()
        .map(|p| p.timestamp.format("%H:%M").to_string())
        .collect()
}

/// Values of `other` aligned to the timestamps of `base`
fn align(base: &[MetricPoint], other: &[MetricPoint]) -> Vec<Option<f64>> {
    let by_time: HashMap<_, _> = other.iter().map(|p| (p.timestamp, p.value)).collect();
    base.iter().map(|p| by_time.get(&p.timestamp).copied()).collect()
}

fn line_chart(
    canvas: &str,
    points: &[MetricPoint],
    reservation: &[MetricPoint],
    label: &str,
    color: &str,
) -> Result<String, serde_json::Error> {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();

    Ok(format!(
        "new Chart(document.getElementById('{canvas}'), {{
  type: 'line',
  data: {{
    labels: {labels},
    datasets: [
      {{ label: '{label} Utilization (%)', data: {values}, borderColor: '{color}', tension: 0.1 }},
      {{ label: '{label} Reservation (%)', data: {reserved}, borderColor: '{color}', borderDash: [6, 4], spanGaps: true, tension: 0.1 }}
    ]
  }},
  options: {{ animation: false, responsive: false, scales: {{ y: {{ beginAtZero: true, max: 100 }} }} }}
}});
",
        labels = script_literal(&time_labels(points))?,
        values = script_literal(&values)?,
        reserved = script_literal(&align(points, reservation))?,
    ))
}

fn daily_chart(data: &ReportData) -> Result<String, serde_json::Error> {
    let averages = &data.metrics.daily_averages;

    let mut days: BTreeMap<NaiveDate, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for day in &averages.cpu {
        days.entry(day.day).or_default().0 = Some(day.avg);
    }
    for day in &averages.memory {
        days.entry(day.day).or_default().1 = Some(day.avg);
    }

    let labels: Vec<String> = days.keys().map(|d| d.format("%Y-%m-%d").to_string()).collect();
    let cpu: Vec<Option<f64>> = days.values().map(|(cpu, _)| *cpu).collect();
    let memory: Vec<Option<f64>> = days.values().map(|(_, memory)| *memory).collect();

    Ok(format!(
        "new Chart(document.getElementById('{canvas}'), {{
  type: 'bar',
  data: {{
    labels: {labels},
    datasets: [
      {{ label: 'CPU Avg (%)', data: {cpu}, backgroundColor: 'rgba(75, 192, 192, 0.5)', borderColor: 'rgb(75, 192, 192)', borderWidth: 1 }},
      {{ label: 'Memory Avg (%)', data: {memory}, backgroundColor: 'rgba(153, 102, 255, 0.5)', borderColor: 'rgb(153, 102, 255)', borderWidth: 1 }}
    ]
  }},
  options: {{ animation: false, responsive: false, scales: {{ y: {{ beginAtZero: true, max: 100 }} }} }}
}});
",
        canvas = CHART_IDS[2],
        labels = script_literal(&labels)?,
        cpu = script_literal(&cpu)?,
        memory = script_literal(&memory)?,
    ))
}

fn services_table(data: &ReportData, html: &mut String) {
    html.push_str("<h2>Services</h2>\n");
    if data.services.is_empty() {
        html.push_str("<p class=\"empty\">No services observed</p>\n");
        return;
    }

    html.push_str(
        "<table>\n<tr><th>Service Name</th><th>Running Count</th><th>Desired Count</th><th>Status</th></tr>\n",
    );
    for service in &data.services {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&service.service_name),
            service.running_count,
            service.desired_count,
            escape(&service.status)
        );
    }
    html.push_str("</table>\n");
}

fn tasks_table(data: &ReportData, html: &mut String) {
    html.push_str("<h2>Recent Tasks (Last 24 Hours)</h2>\n");
    if data.tasks.is_empty() {
        html.push_str("<p class=\"empty\">No tasks created in this window</p>\n");
        return;
    }

    html.push_str("<table>\n<tr><th>Created At</th><th>Status</th><th>Desired Status</th></tr>\n");
    for task in &data.tasks {
        let created = task
            .created_at
            .as_ref()
            .map(timestamp::format)
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            created,
            escape(&task.last_status),
            escape(&task.desired_status)
        );
    }
    html.push_str("</table>\n");
}

fn chart_section(title: &str, canvas: &str, html: &mut String) {
    let _ = writeln!(
        html,
        "<h2>{}</h2>\n<div class=\"chart-container\"><canvas id=\"{}\" width=\"{}\" height=\"{}\"></canvas></div>",
        title, canvas, CHART_WIDTH, CHART_HEIGHT
    );
}

/// Renders the complete report document
pub fn render_report(data: &ReportData, daily_average_days: u32) -> Result<String, serde_json::Error> {
    let cluster = escape(&data.cluster_name);
    let date = data.report_date.format("%Y-%m-%d").to_string();

    let mut html = String::new();
    let _ = writeln!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>ECS Monitoring Report - {} - {}</title>\n<style>\n{}\n</style>\n<script src=\"{}\"></script>\n</head>\n<body>",
        cluster, date, STYLE, CHART_JS
    );
    let _ = writeln!(
        html,
        "<h1>ECS Monitoring Report</h1>\n<p><strong>Cluster:</strong> {}</p>\n<p><strong>Date:</strong> {}</p>",
        cluster, date
    );

    chart_section("CPU Utilization", CHART_IDS[0], &mut html);
    chart_section("Memory Utilization", CHART_IDS[1], &mut html);
    chart_section(
        &format!("Daily Averages (Last {} Days)", daily_average_days),
        CHART_IDS[2],
        &mut html,
    );

    services_table(data, &mut html);
    tasks_table(data, &mut html);

    let metrics = &data.metrics;
    html.push_str("<script>\n");
    html.push_str(&line_chart(
        CHART_IDS[0],
        &metrics.cpu,
        &metrics.cpu_reservation,
        "CPU",
        "rgb(75, 192, 192)",
    )?);
    html.push_str(&line_chart(
        CHART_IDS[1],
        &metrics.memory,
        &metrics.memory_reservation,
        "Memory",
        "rgb(153, 102, 255)",
    )?);
    html.push_str(&daily_chart(data)?);
    html.push_str("window.reportReady = true;\n</script>\n</body>\n</html>\n");

    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{DailyAverages, ReportMetrics};
    use crate::storage::{DailyAggregate, ServiceSnapshot};
    use chrono::{TimeZone, Utc};

    fn point(minute: u32, value: f64) -> MetricPoint {
        MetricPoint {
            cluster: "prod".to_string(),
            metric_name: "cpuUtilization".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 9, minute, 0).unwrap(),
            value,
        }
    }

    fn data() -> ReportData {
        let day = |d: u32, avg: f64| DailyAggregate {
            day: NaiveDate::from_ymd_opt(2024, 3, d).unwrap(),
            avg,
            min: avg,
            max: avg,
        };

        ReportData {
            cluster_name: "prod<script>".to_string(),
            report_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            metrics: ReportMetrics {
                cpu: vec![point(0, 20.0), point(10, 25.0)],
                memory: vec![point(0, 40.0)],
                cpu_reservation: vec![point(10, 50.0)],
                memory_reservation: vec![],
                daily_averages: DailyAverages {
                    cpu: vec![day(9, 21.5), day(10, 24.0)],
                    memory: vec![day(10, 41.0)],
                },
            },
            services: vec![ServiceSnapshot {
                cluster: "prod".to_string(),
                service_name: "api".to_string(),
                service_arn: "arn:service/api".to_string(),
                running_count: 1,
                desired_count: 2,
                status: "ACTIVE".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap(),
            }],
            tasks: vec![],
        }
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
    }

    #[test]
    fn test_document_has_charts_tables_and_ready_flag() {
        let html = render_report(&data(), 7).unwrap();

        for id in CHART_IDS {
            assert!(html.contains(&format!("<canvas id=\"{}\"", id)));
        }
        assert!(html.contains("<td>api</td><td>1</td><td>2</td><td>ACTIVE</td>"));
        assert!(html.contains("No tasks created in this window"));
        assert!(html.contains("Daily Averages (Last 7 Days)"));
        assert!(html.contains("window.reportReady = true;"));
    }

    #[test]
    fn test_cluster_name_is_escaped() {
        let html = render_report(&data(), 7).unwrap();
        assert!(html.contains("prod&lt;script&gt;"));
        assert!(!html.contains("prod<script>"));
    }

    #[test]
    fn test_series_embedded_as_literals() {
        let html = render_report(&data(), 7).unwrap();

        assert!(html.contains(r#"labels: ["09:00","09:10"]"#));
        assert!(html.contains("data: [20.0,25.0]"));
        // Reservation aligned to utilization timestamps
        assert!(html.contains("data: [null,50.0]"));
        // Days present in either series, missing values as gaps
        assert!(html.contains(r#"labels: ["2024-03-09","2024-03-10"]"#));
        assert!(html.contains("data: [null,41.0]"));
    }
}
