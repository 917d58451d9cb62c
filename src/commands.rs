//! Command execution.

use crate::Commands;
use colored::Colorize;
use docwire_client::{Acknowledgment, BulkWriteResult, Client, RemoveSpec, UpdateSpec};
use docwire_protocol::{to_document, Document};
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            let reply = client.ping().await?;
            Ok(format_json(&Value::Object(reply)))
        }

        Commands::Command { db, command } => {
            let command = parse_document_arg(&command)?;
            let reply = client.command(&db, command).await?;
            Ok(format_json(&Value::Object(reply)))
        }

        Commands::Find {
            ns,
            filter,
            sort,
            limit,
            skip,
            batch_size,
            explain,
        } => {
            let filter = parse_optional_document(filter.as_deref())?;
            let mut cursor = client.find(&ns, filter);
            if let Some(ref sort) = sort {
                cursor.sort(&parse_document_arg(sort)?)?;
            }
            if let Some(limit) = limit {
                cursor.limit(limit)?;
            }
            if let Some(skip) = skip {
                cursor.skip(skip)?;
            }
            if let Some(batch_size) = batch_size {
                cursor.batch_size(batch_size)?;
            }

            if explain {
                let plan = cursor.explain().await?;
                return Ok(format_json(&Value::Object(plan)));
            }

            let docs = cursor.to_array().await?;
            if docs.is_empty() {
                return Ok("No documents found".yellow().to_string());
            }
            let values: Vec<Value> = docs.into_iter().map(Value::Object).collect();
            Ok(format_json(&Value::Array(values)))
        }

        Commands::Count { ns, filter } => {
            let filter = parse_optional_document(filter.as_deref())?;
            let n = client.count(&ns, filter).await?;
            Ok(n.to_string())
        }

        Commands::Insert {
            ns,
            documents,
            unordered,
            w,
        } => {
            let value = parse_json_arg(&documents)?;
            let docs = match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(to_document)
                    .collect::<Result<Vec<_>, _>>()?,
                other => vec![to_document(other)?],
            };

            let mut options = client.write_options().clone();
            options.ordered = !unordered;
            if let Some(ref w) = w {
                options.write_concern.w = Some(Acknowledgment::from(w.as_str()));
            }

            let result = client.insert(&ns, docs, Some(&options)).await?;
            format_write_result(&result)
        }

        Commands::Update {
            ns,
            query,
            update,
            upsert,
            multi,
        } => {
            let mut spec = UpdateSpec::new(parse_document_arg(&query)?, parse_document_arg(&update)?);
            spec.upsert = upsert;
            spec.multi = multi;
            let result = client.update(&ns, vec![spec], None).await?;
            format_write_result(&result)
        }

        Commands::Remove { ns, query, single } => {
            let spec = RemoveSpec {
                q: parse_document_arg(&query)?,
                limit: if single { 1 } else { 0 },
            };
            let result = client.remove(&ns, vec![spec], None).await?;
            format_write_result(&result)
        }
    }
}

fn format_write_result(result: &BulkWriteResult) -> Result<String, Box<dyn std::error::Error>> {
    let json = format_json(&serde_json::to_value(result)?);
    if result.has_write_errors() || result.write_concern_error.is_some() {
        Ok(format!("{}\n{}", "Write failed".red(), json))
    } else {
        Ok(json)
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

fn parse_document_arg(arg: &str) -> Result<Document, Box<dyn std::error::Error>> {
    Ok(to_document(parse_json_arg(arg)?)?)
}

fn parse_optional_document(arg: Option<&str>) -> Result<Document, Box<dyn std::error::Error>> {
    match arg {
        Some(arg) => parse_document_arg(arg),
        None => Ok(Document::new()),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
