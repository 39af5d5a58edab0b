//! Upstream endpoint configuration CRUD.

use crate::error::DatabaseError;
use crate::types::EndpointId;
use crate::{Error, Result};

use super::{Database, Endpoint, NewEndpoint};

const ENDPOINT_COLUMNS: &str = r#"
    id, alias, api_key, api_base, model_name, max_tokens, temperature, timeout_secs,
    currency, billing_mode, prompt_price_per_1k, completion_price_per_1k, request_price,
    second_price, minimum_billable_unit, pricing_notes, is_active, created_at, updated_at
"#;

impl Database {
    /// Register a new endpoint configuration
    ///
    /// The base URL must parse as an absolute http(s) URL and the alias must be unique.
    pub async fn insert_endpoint(&self, endpoint: &NewEndpoint) -> Result<EndpointId> {
        validate_endpoint(endpoint)?;
        let now = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO endpoints (
                alias, api_key, api_base, model_name, max_tokens, temperature, timeout_secs,
                currency, billing_mode, prompt_price_per_1k, completion_price_per_1k,
                request_price, second_price, minimum_billable_unit, pricing_notes, is_active,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&endpoint.alias)
        .bind(&endpoint.api_key)
        .bind(endpoint.api_base.trim_end_matches('/'))
        .bind(&endpoint.model_name)
        .bind(endpoint.max_tokens as i64)
        .bind(endpoint.temperature)
        .bind(endpoint.timeout_secs as i64)
        .bind(&endpoint.currency)
        .bind(&endpoint.billing_mode)
        .bind(endpoint.prompt_price_per_1k)
        .bind(endpoint.completion_price_per_1k)
        .bind(endpoint.request_price)
        .bind(endpoint.second_price)
        .bind(endpoint.minimum_billable_unit)
        .bind(&endpoint.pricing_notes)
        .bind(endpoint.is_active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::Database(DatabaseError::ConstraintViolation(format!(
                    "Endpoint alias '{}' already exists",
                    endpoint.alias
                )))
            }
            _ => Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert endpoint: {}",
                e
            ))),
        })?;

        Ok(EndpointId(result.last_insert_rowid()))
    }

    /// Get an endpoint by ID
    pub async fn get_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let query = format!("SELECT {} FROM endpoints WHERE id = ?", ENDPOINT_COLUMNS);
        sqlx::query_as::<_, Endpoint>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get endpoint: {}",
                    e
                )))
            })
    }

    /// Get an endpoint by its alias
    pub async fn get_endpoint_by_alias(&self, alias: &str) -> Result<Option<Endpoint>> {
        let query = format!("SELECT {} FROM endpoints WHERE alias = ?", ENDPOINT_COLUMNS);
        sqlx::query_as::<_, Endpoint>(&query)
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get endpoint by alias: {}",
                    e
                )))
            })
    }

    /// List all endpoints ordered by alias
    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let query = format!("SELECT {} FROM endpoints ORDER BY alias", ENDPOINT_COLUMNS);
        sqlx::query_as::<_, Endpoint>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list endpoints: {}",
                    e
                )))
            })
    }

    /// List endpoints jobs may currently run against
    pub async fn list_active_endpoints(&self) -> Result<Vec<Endpoint>> {
        let query = format!(
            "SELECT {} FROM endpoints WHERE is_active = 1 ORDER BY alias",
            ENDPOINT_COLUMNS
        );
        sqlx::query_as::<_, Endpoint>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list active endpoints: {}",
                    e
                )))
            })
    }

    /// Replace every field of an endpoint
    ///
    /// Returns `false` if no endpoint has the given ID.
    pub async fn update_endpoint(&self, id: EndpointId, endpoint: &NewEndpoint) -> Result<bool> {
        validate_endpoint(endpoint)?;
        let now = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            UPDATE endpoints SET
                alias = ?, api_key = ?, api_base = ?, model_name = ?, max_tokens = ?,
                temperature = ?, timeout_secs = ?, currency = ?, billing_mode = ?,
                prompt_price_per_1k = ?, completion_price_per_1k = ?, request_price = ?,
                second_price = ?, minimum_billable_unit = ?, pricing_notes = ?, is_active = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&endpoint.alias)
        .bind(&endpoint.api_key)
        .bind(endpoint.api_base.trim_end_matches('/'))
        .bind(&endpoint.model_name)
        .bind(endpoint.max_tokens as i64)
        .bind(endpoint.temperature)
        .bind(endpoint.timeout_secs as i64)
        .bind(&endpoint.currency)
        .bind(&endpoint.billing_mode)
        .bind(endpoint.prompt_price_per_1k)
        .bind(endpoint.completion_price_per_1k)
        .bind(endpoint.request_price)
        .bind(endpoint.second_price)
        .bind(endpoint.minimum_billable_unit)
        .bind(&endpoint.pricing_notes)
        .bind(endpoint.is_active)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update endpoint: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Enable or disable an endpoint
    pub async fn set_endpoint_active(&self, id: EndpointId, active: bool) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE endpoints SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set endpoint active flag: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete an endpoint
    ///
    /// Refused with [`DatabaseError::ConstraintViolation`] while any job references it.
    pub async fn delete_endpoint(&self, id: EndpointId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db_err) if is_restricted_delete(&**db_err) => {
                    Error::Database(DatabaseError::ConstraintViolation(format!(
                        "Endpoint {} is still used by jobs",
                        id
                    )))
                }
                _ => Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete endpoint: {}",
                    e
                ))),
            })?;

        Ok(result.rows_affected() > 0)
    }
}

fn validate_endpoint(endpoint: &NewEndpoint) -> Result<()> {
    if endpoint.alias.trim().is_empty() {
        return Err(Error::InvalidInput("endpoint alias must not be empty".into()));
    }
    if endpoint.model_name.trim().is_empty() {
        return Err(Error::InvalidInput("endpoint model name must not be empty".into()));
    }
    let url = url::Url::parse(&endpoint.api_base).map_err(|e| {
        Error::InvalidInput(format!("invalid api_base '{}': {}", endpoint.api_base, e))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidInput(format!(
            "api_base must be http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}

/// Whether a delete was refused by a foreign key
///
/// SQLite reports `ON DELETE RESTRICT` as SQLITE_CONSTRAINT_TRIGGER (1811) and
/// deferred or `NO ACTION` checks as SQLITE_CONSTRAINT_FOREIGNKEY (787).
fn is_restricted_delete(err: &dyn sqlx::error::DatabaseError) -> bool {
    err.is_foreign_key_violation() || matches!(err.code().as_deref(), Some("787" | "1811"))
}
