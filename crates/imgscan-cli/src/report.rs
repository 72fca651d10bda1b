use colored::*;

use imgscan_core::analysis::{ClusterKind, DuplicateReport, LeakageReport, ManifestDiff};

pub fn print_duplicates(report: &DuplicateReport) {
    for (i, cluster) in report.clusters.iter().enumerate() {
        let kind = match cluster.kind {
            ClusterKind::Exact => "exact".red(),
            ClusterKind::Near => "near".yellow(),
        };
        println!(
            "{} {} ({} files)",
            format!("Cluster {}", i + 1).bold(),
            kind,
            cluster.members.len()
        );
        for member in &cluster.members {
            let marker = if *member == cluster.representative { "*" } else { " " };
            println!("  {} {}", marker, member);
        }
    }
    if !report.excluded.is_empty() {
        println!("{}", "Excluded (not analyzable):".bold());
        for excluded in &report.excluded {
            println!("  [{}] {}", excluded.status.red(), excluded.path);
        }
    }
    println!(
        "{} clusters ({} exact), {} redundant files, {} records compared in {} buckets ({} comparisons)",
        format!("{}", report.clusters.len()).cyan(),
        report.exact_clusters(),
        format!("{}", report.redundant_files()).red(),
        report.records_clustered,
        report.buckets,
        report.comparisons,
    );
}

pub fn print_leakage(report: &LeakageReport) {
    for (i, cluster) in report.clusters.iter().enumerate() {
        let labels: Vec<&str> = cluster.labels.iter().map(String::as_str).collect();
        println!(
            "{} [{}]",
            format!("Leak {}", i + 1).bold(),
            labels.join(", ").red()
        );
        for member in &cluster.members {
            println!("  {:>8}  {}", member.label.cyan(), member.path);
        }
    }
    for ((a, b), count) in report.pair_counts() {
        println!("{} <-> {}: {} clusters", a, b, count);
    }
    println!(
        "{} leaked clusters, {} single-label clusters ignored",
        format!("{}", report.clusters.len()).red(),
        report.suppressed_single_label
    );
}

pub fn print_diff(diff: &ManifestDiff) {
    for path in &diff.added {
        println!("{} {}", "+".green(), path);
    }
    for path in &diff.removed {
        println!("{} {}", "-".red(), path);
    }
    for changed in &diff.changed {
        println!("{} {} ({})", "~".yellow(), changed.path, changed.fields.join(", "));
    }
    println!(
        "{} added, {} removed, {} changed, {} unchanged",
        diff.added.len(),
        diff.removed.len(),
        diff.changed.len(),
        diff.unchanged
    );
    println!(
        "old: {} records, {} not ok, {} exact groups | new: {} records, {} not ok, {} exact groups",
        diff.old.records,
        diff.old.not_ok,
        diff.old.exact_duplicate_groups,
        diff.new.records,
        diff.new.not_ok,
        diff.new.exact_duplicate_groups
    );
}
