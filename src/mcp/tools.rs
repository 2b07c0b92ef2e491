use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::connectors::{MailboxApi, TokenEndpoint};
use crate::db::models::PageToken;
use crate::db::Database;
use crate::ingest::{FetchOptions, InboxService, MAX_PAGE_SIZE};

/// Everything a tool call needs: the local store and the ingestion pipeline.
pub struct ToolContext<A, T> {
    pub db: Database,
    pub service: InboxService<A, T>,
}

pub fn tool_schemas() -> Vec<Value> {
    let page_properties = json!({
        "user_id": {"type": "integer", "minimum": 1},
        "max_results": {"type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE},
        "page_token": {"type": "string"}
    });

    let mut search_properties = page_properties.clone();
    search_properties["query"] = json!({"type": "string"});

    let mut fetch_properties = search_properties.clone();
    fetch_properties["query"] = json!({
        "type": "string",
        "description": "Optional Gmail search operators"
    });

    vec![
        json!({
            "name": "mail_fetch",
            "description": "Fetch one page of the Gmail inbox and cache it locally",
            "inputSchema": {
                "type": "object",
                "properties": fetch_properties,
                "required": ["user_id"]
            }
        }),
        json!({
            "name": "mail_search",
            "description": "Search Gmail with search operators and cache the matches",
            "inputSchema": {
                "type": "object",
                "properties": search_properties,
                "required": ["user_id", "query"]
            }
        }),
        json!({
            "name": "mail_get",
            "description": "Return one cached email by local id",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": {"type": "integer", "minimum": 1},
                    "id": {"type": "integer", "minimum": 1}
                },
                "required": ["user_id", "id"]
            }
        }),
        json!({
            "name": "mail_stats",
            "description": "Return cached email counts for a user",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": {"type": "integer", "minimum": 1}
                },
                "required": ["user_id"]
            }
        }),
    ]
}

pub async fn call_tool<A, T>(ctx: &ToolContext<A, T>, name: &str, arguments: Value) -> Result<Value>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    match name {
        "mail_fetch" => mail_fetch(ctx, &arguments).await,
        "mail_search" => mail_search(ctx, &arguments).await,
        "mail_get" => mail_get(ctx, &arguments),
        "mail_stats" => mail_stats(ctx, &arguments),
        other => Err(anyhow!("unknown tool: {other}")),
    }
}

async fn mail_fetch<A, T>(ctx: &ToolContext<A, T>, arguments: &Value) -> Result<Value>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let user_id = required_i64(arguments, "user_id")?;
    let options = FetchOptions {
        max_results: optional_u32(arguments, "max_results")?,
        page_token: optional_string(arguments, "page_token").map(PageToken::new),
        query: optional_string(arguments, "query"),
    };

    let page = ctx.service.fetch(&ctx.db, user_id, &options).await?;
    Ok(serde_json::to_value(page)?)
}

async fn mail_search<A, T>(ctx: &ToolContext<A, T>, arguments: &Value) -> Result<Value>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let user_id = required_i64(arguments, "user_id")?;
    let query = optional_string(arguments, "query").unwrap_or_default();
    let options = FetchOptions {
        max_results: optional_u32(arguments, "max_results")?,
        page_token: optional_string(arguments, "page_token").map(PageToken::new),
        query: None,
    };

    let page = ctx.service.search(&ctx.db, user_id, &query, &options).await?;
    Ok(serde_json::to_value(page)?)
}

fn mail_get<A, T>(ctx: &ToolContext<A, T>, arguments: &Value) -> Result<Value>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let user_id = required_i64(arguments, "user_id")?;
    let id = required_i64(arguments, "id")?;
    let email = ctx
        .service
        .get_by_id(&ctx.db, user_id, id)?
        .ok_or_else(|| anyhow!("email {id} not found for user {user_id}"))?;
    Ok(serde_json::to_value(email)?)
}

fn mail_stats<A, T>(ctx: &ToolContext<A, T>, arguments: &Value) -> Result<Value>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let user_id = required_i64(arguments, "user_id")?;
    let stats = ctx.service.stats(&ctx.db, user_id)?;
    Ok(serde_json::to_value(stats)?)
}

fn required_i64(arguments: &Value, key: &str) -> Result<i64> {
    arguments
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("missing required integer param '{key}'"))
}

fn optional_string(arguments: &Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn optional_u32(arguments: &Value, key: &str) -> Result<Option<u32>> {
    let Some(raw) = arguments.get(key) else {
        return Ok(None);
    };

    let value = raw
        .as_u64()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| anyhow!("param '{key}' must be a positive integer"))?;
    Ok(Some(value))
}
