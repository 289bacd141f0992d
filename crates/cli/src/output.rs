// Output formatting for CLI

use anyhow::Context;
use claimq_durable::persistence::QueueStats;
use claimq_durable::task::Task;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    /// Render `value` for the structured formats; `None` for text
    pub fn render<T: Serialize>(&self, value: &T) -> anyhow::Result<Option<String>> {
        match self {
            OutputFormat::Json => serde_json::to_string_pretty(value)
                .map(Some)
                .context("Failed to encode JSON output"),
            OutputFormat::Yaml => serde_yaml::to_string(value)
                .map(Some)
                .context("Failed to encode YAML output"),
            // Text format is handled by each command
            OutputFormat::Text => Ok(None),
        }
    }

    pub fn print_value<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        if let Some(rendered) = self.render(value)? {
            println!("{}", rendered.trim_end());
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

fn optional(value: Option<impl ToString>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Print one task as key-value lines
pub fn print_task(task: &Task) {
    print_field("ID", &task.id.to_string());
    print_field("Type", &task.task_type);
    print_field("Status", task.status.as_str());
    print_field("Priority", &task.priority.to_string());
    print_field(
        "Attempts",
        &format!("{}/{}", task.attempts, task.max_attempts),
    );
    print_field("Dedup Key", &optional(task.dedup_key.as_deref()));
    print_field("Claimed By", &optional(task.claimed_by.as_deref()));
    print_field("Heartbeat", &optional(task.heartbeat_at.map(|t| t.to_rfc3339())));
    print_field("Available", &task.available_at.to_rfc3339());
    print_field("Created", &task.created_at.to_rfc3339());
    print_field("Payload", &task.payload.to_string());
    if let Some(result) = &task.result {
        print_field("Result", &result.to_string());
    }
    if let Some(error) = &task.error {
        print_field("Error", error);
    }
}

/// Print queue counts as a table
pub fn print_stats(stats: &QueueStats) {
    let columns = [
        ("PENDING", 10),
        ("CLAIMED", 10),
        ("COMPLETED", 10),
        ("FAILED", 10),
        ("TOTAL", 10),
    ];
    print_table_header(&columns);

    let values = [
        stats.pending.to_string(),
        stats.claimed.to_string(),
        stats.completed.to_string(),
        stats.failed.to_string(),
        stats.total().to_string(),
    ];
    let row: Vec<(&str, usize)> = values
        .iter()
        .zip(columns.iter())
        .map(|(value, (_, width))| (value.as_str(), *width))
        .collect();
    print_table_row(&row);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header.trim_end());
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    let row: String = values
        .iter()
        .map(|(val, width)| format!("{:<width$}", truncate(val, *width), width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row.trim_end());
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width || width < 4 {
        return value.to_string();
    }
    let kept: String = value.chars().take(width - 3).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("yaml"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::from_str("anything"), OutputFormat::Text);
    }

    #[test]
    fn test_render() {
        let stats = QueueStats {
            pending: 2,
            ..Default::default()
        };
        let json = OutputFormat::Json.render(&stats).unwrap().unwrap();
        assert!(json.contains("\"pending\": 2"));

        let yaml = OutputFormat::Yaml.render(&stats).unwrap().unwrap();
        assert!(yaml.contains("pending: 2"));

        assert!(OutputFormat::Text.render(&stats).unwrap().is_none());
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }
}
