//! Supabase (PostgREST) backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Direction, Filter, Query, RelationalStore, Row, StoreError, Table};

const SERIAL_RPC: &str = "get_next_invoice_serial";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

impl SupabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.anon_key.is_empty()
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }
}

pub struct SupabaseStore {
    http: Client,
    config: SupabaseConfig,
    access_token: RwLock<Option<String>>,
}

/// PostgREST operator form of a filter, e.g. `eq.u1` or `not.is.null`.
fn filter_param(filter: &Filter) -> (String, String) {
    let operand = |value: &Value| match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let column = filter.column().to_string();
    match filter {
        Filter::Eq(_, Value::Null) | Filter::IsNull(_) => (column, "is.null".to_string()),
        Filter::NotNull(_) => (column, "not.is.null".to_string()),
        Filter::Eq(_, value) => (column, format!("eq.{}", operand(value))),
        Filter::Gte(_, value) => (column, format!("gte.{}", operand(value))),
        Filter::Lt(_, value) => (column, format!("lt.{}", operand(value))),
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query.filters.iter().map(filter_param).collect();
    if let Some(order) = &query.order {
        let direction = match order.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        params.push(("order".to_string(), format!("{}.{}.nullslast", order.column, direction)));
    }
    params
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            access_token: RwLock::new(None),
        }
    }

    pub fn with_token(self, access_token: String) -> Self {
        *self.access_token.write() = Some(access_token);
        self
    }

    /// Swap the bearer token, e.g. after the auth provider refreshed it.
    pub fn set_access_token(&self, access_token: Option<String>) {
        *self.access_token.write() = access_token;
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.config.anon_key.clone());

        self.http
            .request(method, self.config.endpoint(path))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
    }

    fn table_path(table: Table) -> String {
        format!("rest/v1/{}", table.name())
    }

    async fn check(table: Table, response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Conflict {
                table: table.name(),
                key: body,
            });
        }
        Err(StoreError::Api(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl RelationalStore for SupabaseStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query_params(query));

        let response = self
            .request(reqwest::Method::GET, &Self::table_path(table))
            .query(&params)
            .send()
            .await?;

        Ok(Self::check(table, response).await?.json().await?)
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, &Self::table_path(table))
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await?;

        Self::check(table, response).await?;
        Ok(())
    }

    async fn update(&self, table: Table, query: &Query, patch: Row) -> Result<u64, StoreError> {
        let response = self
            .request(reqwest::Method::PATCH, &Self::table_path(table))
            .header("Prefer", "return=representation")
            .query(&query_params(query))
            .json(&patch)
            .send()
            .await?;

        let rows: Vec<Row> = Self::check(table, response).await?.json().await?;
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: Table, query: &Query) -> Result<u64, StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, &Self::table_path(table))
            .header("Prefer", "return=representation")
            .query(&query_params(query))
            .send()
            .await?;

        let rows: Vec<Row> = Self::check(table, response).await?.json().await?;
        Ok(rows.len() as u64)
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, &Self::table_path(table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", table.key_column())])
            .json(&[row])
            .send()
            .await?;

        Self::check(table, response).await?;
        Ok(())
    }

    async fn next_invoice_serial(&self, prefix: &str, date_key: &str) -> Result<u32, StoreError> {
        let response = self
            .request(reqwest::Method::POST, &format!("rest/v1/rpc/{}", SERIAL_RPC))
            .json(&serde_json::json!({ "prefix": prefix, "date_key": date_key }))
            .send()
            .await?;

        let value: Value = Self::check(Table::Invoices, response).await?.json().await?;
        value
            .as_u64()
            .and_then(|serial| u32::try_from(serial).ok())
            .ok_or_else(|| StoreError::Api(format!("unexpected serial response: {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_params_use_postgrest_operators() {
        let query = Query::new()
            .eq("user_id", "u1")
            .eq("read", false)
            .is_null("deletedAt")
            .not_null("deletedBy")
            .gte("deletedAt", "2024-01-01T00:00:00.000Z")
            .order_by("timestamp", Direction::Descending);

        let params = query_params(&query);

        assert_eq!(
            params,
            vec![
                ("user_id".to_string(), "eq.u1".to_string()),
                ("read".to_string(), "eq.false".to_string()),
                ("deletedAt".to_string(), "is.null".to_string()),
                ("deletedBy".to_string(), "not.is.null".to_string()),
                ("deletedAt".to_string(), "gte.2024-01-01T00:00:00.000Z".to_string()),
                ("order".to_string(), "timestamp.desc.nullslast".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let config = SupabaseConfig {
            url: "https://example.supabase.co/".to_string(),
            anon_key: "anon".to_string(),
        };
        assert!(config.is_configured());
        assert_eq!(
            config.endpoint("rest/v1/notifications"),
            "https://example.supabase.co/rest/v1/notifications"
        );
        assert!(!SupabaseConfig::default().is_configured());
    }
}
