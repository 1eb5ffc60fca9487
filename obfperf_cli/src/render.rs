use obfperf_core::aggregator::MetricAggregate;
use obfperf_core::comparison::{ComparisonEntry, ComparisonResult, EntryStatus};
use obfperf_core::record::Metric;
use std::fmt::Write;

const HEADERS: [&str; 8] = [
    "variant", "status", "n", "wall (s)", "rss (KiB)", "faults", "static", "overhead",
];

/// Plain-text table, one row per entry, followed by rejected configs.
pub fn render_table(result: &ComparisonResult) -> String {
    let rows: Vec<[String; 8]> = result.entries().iter().map(row).collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &HEADERS.map(String::from), &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in &rows {
        push_line(&mut out, row, &widths);
    }

    if !result.rejected().is_empty() {
        let _ = writeln!(out, "\nrejected configs:");
        for rejected in result.rejected() {
            let _ = writeln!(out, "  {}: {}", rejected.path.display(), rejected.reason);
        }
    }
    out
}

fn push_line(out: &mut String, cells: &[String; 8], widths: &[usize; 8]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    let _ = writeln!(out, "{}", padded.join("  ").trim_end());
}

fn row(entry: &ComparisonEntry) -> [String; 8] {
    let label = entry.variant.label().to_string();
    let aggregate = &entry.aggregate;
    let status = match entry.status() {
        EntryStatus::Measured(_) => "ok".to_string(),
        EntryStatus::NoUsableSamples => "no usable runs".to_string(),
        EntryStatus::ObfuscationFailed(reason) => format!("obfuscation failed: {reason}"),
        EntryStatus::CompileFailed(reason) => format!("compile failed: {reason}"),
    };
    let samples = if entry.variant.is_built() {
        format!("{}/{}", aggregate.samples(), entry.runs.len())
    } else {
        "-".to_string()
    };
    let wall = aggregate
        .get(Metric::WallSeconds)
        .map(|s| format!("{:.4} ± {:.4}", s.mean, s.std_dev))
        .unwrap_or_else(|| "-".to_string());
    let overhead = entry
        .overhead
        .get(&Metric::WallSeconds)
        .map(|ratio| format!("{ratio:.2}x"))
        .unwrap_or_else(|| "-".to_string());

    [
        label,
        status,
        samples,
        wall,
        mean_of(aggregate, Metric::MaxRssKb),
        mean_of(aggregate, Metric::PageFaults),
        static_scores(
            aggregate,
            entry
                .variant
                .code_size()
                .and_then(|size| size.compression_distance),
        ),
        overhead,
    ]
}

fn mean_of(aggregate: &MetricAggregate, metric: Metric) -> String {
    aggregate
        .get(metric)
        .map(|s| format!("{:.0}", s.mean))
        .unwrap_or_else(|| "-".to_string())
}

fn static_scores(aggregate: &MetricAggregate, compression_distance: Option<f64>) -> String {
    let mut pairs: Vec<String> = compression_distance
        .map(|ncd| format!("ncd={ncd:.3}"))
        .into_iter()
        .collect();
    if let Some(snapshot) = aggregate.static_scores() {
        pairs.extend(
            snapshot
                .scores
                .iter()
                .map(|(name, value)| format!("{name}={value}")),
        );
    }
    if pairs.is_empty() {
        "-".to_string()
    } else {
        pairs.join(",")
    }
}
