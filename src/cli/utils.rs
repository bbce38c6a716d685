use serde_json::{json, Value};

use crate::cli::OutputFormat;

/// Output a success message in the appropriate format
pub fn output_success(
    output_format: &OutputFormat,
    message: &str,
    data: Option<Value>,
) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let mut response = json!({
                "success": true,
                "message": message
            });

            if let (Some(Value::Object(extra)), Some(object)) = (data, response.as_object_mut()) {
                object.extend(extra);
            }

            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Text => {
            println!("✓ {}", message);
        }
    }
    Ok(())
}

/// Output a migration record: the raw projection as JSON, or a short summary
pub fn output_record(output_format: &OutputFormat, record: &Value) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(record)?);
        }
        OutputFormat::Text => {
            for line in summarize_record(record) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

pub fn summarize_record(record: &Value) -> Vec<String> {
    let field = |name: &str| record[name].as_str().unwrap_or("-").to_string();

    let mut lines = vec![
        format!("Migration:  {}", field("migrationId")),
        format!("Org:        {}", field("orgId")),
        format!("Direction:  {}", field("direction")),
        format!("Status:     {}", field("status")),
        format!("Source:     {}", field("source")),
        format!("Target:     {}", field("target")),
    ];
    if record["dryRun"].as_bool().unwrap_or(false) {
        lines.push("Dry run:    yes".to_string());
    }
    if let Some(error) = record["errorMessage"].as_str() {
        lines.push(format!("Error:      {}", error));
    }

    if let Some(progress) = record["collectionsProgress"].as_object() {
        lines.push("Collections:".to_string());
        for (name, p) in progress {
            let copied = p["copied"].as_u64().unwrap_or(0);
            let total = p["total"].as_u64().unwrap_or(0);
            let marker = if p["done"].as_bool().unwrap_or(false) { "done" } else { "" };
            lines.push(format!("  {:<20} {:>8}/{:<8} {}", name, copied, total, marker).trim_end().to_string());
        }
    }
    lines
}
