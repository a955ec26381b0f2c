//! Talks to a Supabase project over its PostgREST interface.
//!
//! Realtime is not available over plain HTTP, so [`SupabaseBackend::subscribe`] always fails and
//! channels opened against it fall back to polling.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;

use super::{
    Backend, BackendError, ChannelHandle, ChannelSink, Condition, Direction, Filter, Subscription,
    Table,
};

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl SupabaseConfig {
    /// Read `SUPABASE_URL` and `SUPABASE_ANON_KEY`, honouring a `.env` file if there is one.
    pub fn from_env() -> Option<Self> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }
        let supabase_url = std::env::var("SUPABASE_URL").ok()?;
        let supabase_anon_key = std::env::var("SUPABASE_ANON_KEY").ok()?;
        Some(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_anon_key,
        })
    }
}

pub struct SupabaseBackend {
    client: reqwest::Client,
    config: SupabaseConfig,
    access_token: String,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            access_token: access_token.into(),
        }
    }

    fn request(&self, method: Method, table: Table, filter: &Filter) -> RequestBuilder {
        let SupabaseConfig {
            supabase_url,
            supabase_anon_key,
        } = &self.config;

        self.client
            .request(method, format!("{supabase_url}/rest/v1/{}", table.name()))
            .header("apikey", supabase_anon_key)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .query(&query_pairs(filter))
    }

    async fn send(request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Network(format!("{e:?}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Status { status, body });
        }
        Ok(response)
    }

    async fn rows(response: Response) -> Result<Vec<Value>, BackendError> {
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Network(format!("{e:?}")))?;
        serde_json::from_str(&body).map_err(|e| {
            BackendError::Decode(format!("{e}. Body: {body}"))
        })
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_list_item(value: &Value) -> String {
    let rendered = render(value);
    if rendered.contains([',', '(', ')', '"']) {
        format!("\"{}\"", rendered.replace('"', "\\\""))
    } else {
        rendered
    }
}

/// PostgREST query parameters for `filter`.
pub fn query_pairs(filter: &Filter) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = filter
        .conditions()
        .iter()
        .map(|condition| match condition {
            Condition::Eq { column, value } => (column.clone(), format!("eq.{}", render(value))),
            Condition::In { column, values } => {
                let list: Vec<String> = values.iter().map(render_list_item).collect();
                (column.clone(), format!("in.({})", list.join(",")))
            }
        })
        .collect();
    if let Some(order) = filter.order() {
        let direction = match order.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
    }
    pairs
}

/// The total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range(headers: &HeaderMap) -> Option<usize> {
    headers
        .get("content-range")
        .and_then(|value: &HeaderValue| value.to_str().ok())
        .and_then(|range| range.rsplit_once('/'))
        .and_then(|(_, total)| total.parse().ok())
}

impl Backend for SupabaseBackend {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, BackendError> {
        let request = self
            .request(Method::GET, table, filter)
            .query(&[("select", "*")]);
        Self::rows(Self::send(request).await?).await
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<usize, BackendError> {
        let request = self
            .request(Method::HEAD, table, filter)
            .header("Prefer", "count=exact");
        let response = Self::send(request).await?;
        parse_content_range(response.headers()).ok_or_else(|| {
            BackendError::Decode(format!("missing count for {table}"))
        })
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let request = self
            .request(Method::POST, table, &Filter::new())
            .header("Prefer", "return=representation")
            .json(&row);
        let mut rows = Self::rows(Self::send(request).await?).await?;
        if rows.is_empty() {
            return Err(BackendError::Decode(format!(
                "insert into {table} returned no row"
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<usize, BackendError> {
        let request = self
            .request(Method::PATCH, table, filter)
            .header("Prefer", "return=representation")
            .json(&patch);
        Ok(Self::rows(Self::send(request).await?).await?.len())
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<usize, BackendError> {
        let request = self
            .request(Method::DELETE, table, filter)
            .header("Prefer", "return=representation");
        Ok(Self::rows(Self::send(request).await?).await?.len())
    }

    async fn subscribe(
        &self,
        subscription: Subscription,
        _sink: ChannelSink,
    ) -> Result<ChannelHandle, BackendError> {
        log::debug!(
            "Realtime unavailable, channel {} will poll",
            subscription.channel
        );
        Err(BackendError::Unsupported("realtime subscriptions"))
    }

    async fn unsubscribe(&self, _handle: &ChannelHandle) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs_follow_postgrest_syntax() {
        let filter = Filter::new()
            .eq("trainer_id", "abc")
            .is_in("id", [1, 2, 3])
            .order_by("created_at", Direction::Descending);

        assert_eq!(
            query_pairs(&filter),
            vec![
                ("trainer_id".to_string(), "eq.abc".to_string()),
                ("id".to_string(), "in.(1,2,3)".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
            ]
        );
    }

    #[test]
    fn test_list_items_with_reserved_characters_are_quoted() {
        let filter = Filter::new().is_in("full_name", ["Smith, Jo", "Ann"]);
        assert_eq!(
            query_pairs(&filter)[0].1,
            "in.(\"Smith, Jo\",Ann)".to_string()
        );
    }

    #[test]
    fn test_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert("content-range", HeaderValue::from_static("0-24/3573"));
        assert_eq!(parse_content_range(&headers), Some(3573));

        headers.insert("content-range", HeaderValue::from_static("*/0"));
        assert_eq!(parse_content_range(&headers), Some(0));

        headers.insert("content-range", HeaderValue::from_static("*/*"));
        assert_eq!(parse_content_range(&headers), None);
    }
}
