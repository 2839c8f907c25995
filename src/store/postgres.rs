//! Postgres-backed stores (sqlx)
//!
//! Writes retry 3×500ms before surfacing an error; a dropped database
//! connection must not take a call down with it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use super::{ProvisionedDevice, ProvisionedDeviceStore, Registration, RegistrationStore};
use crate::config::DatabaseConfig;
use crate::services::cdr::{CallRecord, CdrSink};
use crate::{Error, Result};

const WRITE_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.url())
        .await?;
    info!("Connected to database {}:{}/{}", config.host, config.port, config.name);
    Ok(pool)
}

/// Create the core-owned tables when they do not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS registered_phones (
            id BIGSERIAL PRIMARY KEY,
            extension TEXT NOT NULL,
            contact_uri TEXT NOT NULL,
            contact_host TEXT,
            contact_port INT NOT NULL DEFAULT 5060,
            transport TEXT NOT NULL DEFAULT 'udp',
            mac TEXT,
            user_agent TEXT,
            first_registered TIMESTAMPTZ NOT NULL,
            last_registered TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            UNIQUE (extension, contact_uri)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provisioned_devices (
            id BIGSERIAL PRIMARY KEY,
            mac TEXT NOT NULL UNIQUE,
            extension TEXT NOT NULL,
            vendor TEXT NOT NULL,
            model TEXT NOT NULL,
            config_url TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            last_provisioned TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_records (
            id BIGSERIAL PRIMARY KEY,
            call_id TEXT NOT NULL,
            caller TEXT NOT NULL,
            callee TEXT NOT NULL,
            start_time TIMESTAMPTZ NOT NULL,
            answer_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ NOT NULL,
            disposition TEXT NOT NULL,
            payload JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn with_write_retry<F, Fut>(mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<(), sqlx::Error>>,
{
    let mut last_error = None;
    for attempt in 1..=WRITE_RETRIES {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Database write failed (attempt {}/{}): {}", attempt, WRITE_RETRIES, e);
                last_error = Some(e);
                if attempt < WRITE_RETRIES {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error
        .map(Error::Database)
        .unwrap_or_else(|| Error::internal("database retry loop exhausted")))
}

fn registration_from_row(row: &PgRow) -> Registration {
    Registration {
        extension: row.get::<Option<String>, _>("extension").unwrap_or_default(),
        contact_uri: row.get::<Option<String>, _>("contact_uri").unwrap_or_default(),
        contact_host: row.get::<Option<String>, _>("contact_host").unwrap_or_default(),
        contact_port: row.get::<i32, _>("contact_port") as u16,
        transport: row.get("transport"),
        mac: row.get("mac"),
        user_agent: row.get("user_agent"),
        first_registered: row.get("first_registered"),
        last_registered: row.get("last_registered"),
        expires_at: row.get("expires_at"),
    }
}

pub struct PgRegistrationStore {
    pool: PgPool,
}

impl PgRegistrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistrationStore for PgRegistrationStore {
    async fn upsert(&self, registration: Registration) -> Result<()> {
        let pool = self.pool.clone();
        with_write_retry(|| {
            let pool = pool.clone();
            let r = registration.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO registered_phones
                        (extension, contact_uri, contact_host, contact_port, transport,
                         mac, user_agent, first_registered, last_registered, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (extension, contact_uri) DO UPDATE SET
                        contact_host = EXCLUDED.contact_host,
                        contact_port = EXCLUDED.contact_port,
                        transport = EXCLUDED.transport,
                        mac = COALESCE(EXCLUDED.mac, registered_phones.mac),
                        user_agent = EXCLUDED.user_agent,
                        last_registered = EXCLUDED.last_registered,
                        expires_at = EXCLUDED.expires_at
                    "#,
                )
                .bind(&r.extension)
                .bind(&r.contact_uri)
                .bind(&r.contact_host)
                .bind(r.contact_port as i32)
                .bind(&r.transport)
                .bind(&r.mac)
                .bind(&r.user_agent)
                .bind(r.first_registered)
                .bind(r.last_registered)
                .bind(r.expires_at)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn remove(&self, extension: &str, contact_uri: &str) -> Result<()> {
        sqlx::query("DELETE FROM registered_phones WHERE extension = $1 AND contact_uri = $2")
            .bind(extension)
            .bind(contact_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Registration>> {
        let rows = sqlx::query("SELECT * FROM registered_phones")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(registration_from_row).collect())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Registration>> {
        let rows = sqlx::query("SELECT * FROM registered_phones WHERE expires_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(registration_from_row).collect())
    }

    async fn purge_incomplete(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM registered_phones
            WHERE mac IS NULL OR mac = ''
               OR contact_host IS NULL OR contact_host = ''
               OR extension IS NULL OR extension = ''
            "#,
        )
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!("Startup cleanup removed {} incomplete registration rows", removed);
        }
        Ok(removed)
    }
}

pub struct PgProvisionedDeviceStore {
    pool: PgPool,
}

impl PgProvisionedDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn device_from_row(row: &PgRow) -> ProvisionedDevice {
    ProvisionedDevice {
        mac: row.get("mac"),
        extension: row.get("extension"),
        vendor: row.get("vendor"),
        model: row.get("model"),
        config_url: row.get("config_url"),
        created_at: row.get("created_at"),
        last_provisioned: row.get("last_provisioned"),
    }
}

#[async_trait]
impl ProvisionedDeviceStore for PgProvisionedDeviceStore {
    async fn get(&self, mac: &str) -> Result<Option<ProvisionedDevice>> {
        let row = sqlx::query("SELECT * FROM provisioned_devices WHERE mac = $1")
            .bind(mac)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(device_from_row))
    }

    async fn upsert(&self, device: ProvisionedDevice) -> Result<()> {
        let pool = self.pool.clone();
        with_write_retry(|| {
            let pool = pool.clone();
            let d = device.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO provisioned_devices
                        (mac, extension, vendor, model, config_url, created_at, last_provisioned)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (mac) DO UPDATE SET
                        extension = EXCLUDED.extension,
                        vendor = EXCLUDED.vendor,
                        model = EXCLUDED.model,
                        config_url = EXCLUDED.config_url,
                        last_provisioned = EXCLUDED.last_provisioned
                    "#,
                )
                .bind(&d.mac)
                .bind(&d.extension)
                .bind(&d.vendor)
                .bind(&d.model)
                .bind(&d.config_url)
                .bind(d.created_at)
                .bind(d.last_provisioned)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn delete(&self, mac: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM provisioned_devices WHERE mac = $1")
            .bind(mac)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn all(&self) -> Result<Vec<ProvisionedDevice>> {
        let rows = sqlx::query("SELECT * FROM provisioned_devices ORDER BY mac")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(device_from_row).collect())
    }
}

/// CDR sink writing one row per completed call.
pub struct PgCdrSink {
    pool: PgPool,
}

impl PgCdrSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CdrSink for PgCdrSink {
    async fn record(&self, record: CallRecord) {
        let payload = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!("CDR for call {} not serializable: {}", record.call_id, e);
                return;
            }
        };
        let pool = self.pool.clone();
        // Fire-and-forget: a CDR write failure is an alarm, never a call
        // failure.
        let result = with_write_retry(|| {
            let pool = pool.clone();
            let r = record.clone();
            let payload = payload.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO call_records
                        (call_id, caller, callee, start_time, answer_time, end_time,
                         disposition, payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(&r.call_id)
                .bind(&r.caller)
                .bind(&r.callee)
                .bind(r.start_time)
                .bind(r.answer_time)
                .bind(r.end_time)
                .bind(r.disposition.as_str())
                .bind(payload)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await;

        if let Err(e) = result {
            warn!("Dropping CDR for call {}: {}", record.call_id, e);
        }
    }
}
