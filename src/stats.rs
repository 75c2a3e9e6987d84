//! Terminal renderers for the `queue`, `registry` and `research` commands.
//!
//! Everything here prints to stdout in fixed-width tables; JSON output is
//! produced directly from the serializable store types instead.

use chrono::{DateTime, Utc};

use crate::models::{SourceVisit, WorkItem};
use crate::queue::QueueStats;
use crate::registry::RegistryStats;
use crate::research::{SessionAudit, Validation, REQUIRED_FIELDS};

pub fn print_queue_stats(stats: &QueueStats) {
    println!("Discovery Queue");
    println!("===============");
    println!();
    println!("  Total items: {}", stats.total());

    if !stats.by_status.is_empty() {
        println!();
        println!("  {:<12} {:>8} {:>14}", "STATUS", "ITEMS", "AVG PRIORITY");
        println!("  {}", "-".repeat(36));
        for s in &stats.by_status {
            println!(
                "  {:<12} {:>8} {:>14.1}",
                s.status.as_str(),
                s.count,
                s.avg_priority
            );
        }
    }

    if !stats.pending_by_kind.is_empty() {
        println!();
        println!("  Pending by kind:");
        for (kind, count) in &stats.pending_by_kind {
            println!("    {:<12} {:>6}", kind.as_str(), count);
        }
    }
    println!();
}

pub fn print_items(items: &[WorkItem]) {
    if items.is_empty() {
        println!("No pending items.");
        return;
    }
    println!(
        "  {:<28} {:>3} {:<10} {:<10} {:<12}   {}",
        "ID", "PRI", "KIND", "STATUS", "ENQUEUED", "SOURCE"
    );
    println!("  {}", "-".repeat(96));
    for item in items {
        println!(
            "  {:<28} {:>3} {:<10} {:<10} {:<12}   {}",
            truncate(&item.id, 28),
            item.priority,
            item.kind.as_str(),
            item.status.as_str(),
            format_relative(item.enqueued_at),
            item.source_id
        );
    }
}

pub fn print_item(item: &WorkItem) {
    println!("  ID:        {}", item.id);
    println!("  Kind:      {}", item.kind);
    println!("  Priority:  {}", item.priority);
    println!("  Status:    {}", item.status);
    println!("  Source:    {} ({})", item.source_id, item.source_kind);
    println!("  Enqueued:  {}", format_iso(item.enqueued_at));
    if let Some(claimed) = item.claimed_at {
        println!("  Claimed:   {}", format_iso(claimed));
    }
}

pub fn print_visit(visit: &SourceVisit) {
    println!("  URL:         {}", visit.url);
    println!(
        "  Kind:        {}",
        visit.kind.map(|k| k.as_str()).unwrap_or("unknown")
    );
    println!("  Scans:       {}", visit.scan_count);
    println!("  Items found: {}", visit.items_yielded);
    println!("  First seen:  {}", format_iso(visit.first_seen_at));
    println!("  Last seen:   {}", format_relative(visit.last_seen_at));
}

pub fn print_sources(visits: &[SourceVisit]) {
    if visits.is_empty() {
        println!("No sources registered.");
        return;
    }
    println!(
        "  {:<10} {:>6} {:>6} {:<12}   {}",
        "KIND", "SCANS", "ITEMS", "LAST SEEN", "URL"
    );
    println!("  {}", "-".repeat(80));
    for v in visits {
        println!(
            "  {:<10} {:>6} {:>6} {:<12}   {}",
            v.kind.map(|k| k.as_str()).unwrap_or("-"),
            v.scan_count,
            v.items_yielded,
            format_relative(v.last_seen_at),
            v.url
        );
    }
}

pub fn print_registry_stats(stats: &RegistryStats) {
    println!("Source Registry");
    println!("===============");
    println!();
    println!("  Sources:     {}", stats.total_sources);
    println!("  Scans:       {}", stats.total_scans);
    println!("  Items found: {}", stats.total_items);

    if !stats.by_kind.is_empty() {
        println!();
        println!("  {:<12} {:>8} {:>8} {:>8}", "KIND", "SOURCES", "SCANS", "ITEMS");
        println!("  {}", "-".repeat(40));
        for k in &stats.by_kind {
            println!(
                "  {:<12} {:>8} {:>8} {:>8}",
                k.kind.map(|k| k.as_str()).unwrap_or("unknown"),
                k.sources,
                k.scans,
                k.items
            );
        }
    }
    println!();
}

pub fn print_audit(item_id: &str, audits: &[SessionAudit]) {
    if audits.is_empty() {
        println!("No research sessions for '{}'.", item_id);
        return;
    }
    println!("Research history for '{}'", item_id);
    for audit in audits {
        let s = &audit.session;
        println!();
        println!("  Session:      {}", s.research_id);
        println!("  Status:       {}", s.status.as_str());
        println!("  Started:      {}", format_iso(s.started_at));
        if let Some(score) = s.completeness_score {
            println!(
                "  Completeness: {:.3} ({} required fields)",
                score,
                REQUIRED_FIELDS.len()
            );
        }
        if let Some(confidence) = s.overall_confidence {
            println!("  Confidence:   {}", confidence);
        }
        for step in &audit.steps {
            let fields: Vec<&str> = step.fields_found.iter().map(String::as_str).collect();
            println!(
                "    #{:<4} {:<12} {:<10} {}  [{}]",
                step.step_id,
                step.confidence.as_str(),
                step.source_kind.as_str(),
                step.source_url,
                fields.join(", ")
            );
            if let Some(notes) = &step.notes {
                println!("          {}", notes);
            }
        }
    }
    println!();
}

pub fn print_validation(v: &Validation) {
    println!("  Research:     {}", v.research_id);
    println!(
        "  Verdict:      {}",
        if v.passed() { "PASS" } else { "FAIL" }
    );
    println!(
        "  Completeness: {:.3} (threshold {:.2})",
        v.completeness_score, v.threshold
    );
    println!("  Confidence:   {}", v.overall_confidence);
    for issue in &v.issues {
        println!("    - {}", issue);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_iso(ts)
    }
}

fn format_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_relative_formatting() {
        let now = Utc::now();
        assert_eq!(format_relative(now), "just now");
        assert_eq!(format_relative(now - Duration::minutes(1)), "1 min ago");
        assert_eq!(format_relative(now - Duration::hours(5)), "5 hours ago");
        assert_eq!(format_relative(now - Duration::days(2)), "2 days ago");
    }

    #[test]
    fn test_truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
