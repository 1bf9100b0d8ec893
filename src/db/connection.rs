//! TDS connection wrapper around tiberius.
//!
//! One [`MssqlConnection`] owns one authenticated TDS session. The pool
//! never touches tiberius directly: it drives connections through the
//! [`PoolableConnection`] trait and mints them through a
//! [`ConnectionFactory`], which keeps the pool testable without a server.
//!
//! Values cross the wire as [`ColumnData`] and leave this module as
//! `serde_json::Value`: numbers as numbers, decimals as exact strings,
//! binary as base64, temporal types as ISO 8601 strings.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::TryStreamExt;
use serde_json::{Value as JsonValue, json};
use tiberius::time::{Date, DateTime2, DateTimeOffset, Time};
use tiberius::{
    AuthMethod, Client, ColumnData, ColumnType, Config, EncryptionLevel, QueryItem, Row, ToSql,
};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::ConnectOptions;
use crate::db::pool::{ConnectionFactory, PoolableConnection};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, ResultSet, SqlParam};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Connection
// =============================================================================

/// A live session against one SQL Server instance.
pub struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
    id: u64,
    default_database: String,
}

impl MssqlConnection {
    /// Open a TCP + TDS session. The whole handshake, TCP connect included,
    /// is bounded by `options.connect_timeout`.
    pub async fn connect(options: &ConnectOptions) -> DbResult<Self> {
        let mut config = Config::new();
        config.host(&options.host);
        config.port(options.port);
        config.database(&options.database);
        config.authentication(AuthMethod::sql_server(&options.user, &options.password));
        if options.encrypt {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        if options.trust_server_certificate {
            config.trust_cert();
        }

        let addr = config.get_addr();
        let handshake = async {
            let tcp = TcpStream::connect(&addr).await?;
            tcp.set_nodelay(true)?;
            let client = Client::connect(config, tcp.compat_write()).await?;
            Ok::<_, DbError>(client)
        };
        let client = tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| DbError::timeout("connect", options.connect_timeout.as_secs()))??;

        Ok(Self {
            client,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            default_database: options.database.clone(),
        })
    }

    /// Database the session was opened against; executors restore it after
    /// a per-call override.
    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    /// Run one parameterized statement and collect at most `max_rows` rows.
    ///
    /// Returns the rows plus a flag telling whether the server had more.
    /// Stopping early is safe: tiberius drains unread packets before the
    /// next command on this session.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: usize,
    ) -> DbResult<(ResultSet, bool)> {
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let mut stream = self.client.query(sql, &refs).await?;

        let mut columns: Vec<ColumnMetadata> = Vec::new();
        let mut rows: Vec<Vec<JsonValue>> = Vec::new();
        let mut truncated = false;

        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    if columns.is_empty() {
                        columns = meta
                            .columns()
                            .iter()
                            .map(|c| ColumnMetadata::new(c.name(), column_type_name(c.column_type())))
                            .collect();
                    }
                }
                QueryItem::Row(row) => {
                    if rows.len() >= max_rows {
                        truncated = true;
                        break;
                    }
                    rows.push(row_to_json(row));
                }
            }
        }

        Ok((ResultSet::new(columns, rows), truncated))
    }

    /// Run one parameterized batch and collect every result set in full.
    /// Procedure calls use this; row caps are enforced by the caller.
    pub async fn query_all_sets(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<Vec<ResultSet>> {
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let results = self.client.query(sql, &refs).await?.into_results().await?;

        let sets = results
            .into_iter()
            .map(|rows| {
                let columns = rows
                    .first()
                    .map(|row| {
                        row.columns()
                            .iter()
                            .map(|c| {
                                ColumnMetadata::new(c.name(), column_type_name(c.column_type()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let json_rows = rows.into_iter().map(row_to_json).collect();
                ResultSet::new(columns, json_rows)
            })
            .collect();
        Ok(sets)
    }

    /// Run one parameterized statement that returns no rows; reports the
    /// total rows affected.
    pub async fn exec(&mut self, sql: &str, params: &[SqlParam]) -> DbResult<u64> {
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let result = self.client.execute(sql, &refs).await?;
        Ok(result.rows_affected().iter().copied().sum())
    }

    /// Run an unparameterized batch, discarding any results. Used for
    /// session statements such as `USE` and transaction control.
    pub async fn batch(&mut self, sql: &str) -> DbResult<()> {
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

impl fmt::Debug for MssqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlConnection")
            .field("id", &self.id)
            .field("default_database", &self.default_database)
            .finish_non_exhaustive()
    }
}

impl PoolableConnection for MssqlConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }

    async fn close(self) {
        let _ = self.client.close().await;
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Mints [`MssqlConnection`]s from one set of connect options.
#[derive(Debug, Clone)]
pub struct MssqlFactory {
    options: ConnectOptions,
}

impl MssqlFactory {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

impl ConnectionFactory for MssqlFactory {
    type Connection = MssqlConnection;

    async fn connect(&self) -> DbResult<MssqlConnection> {
        MssqlConnection::connect(&self.options).await
    }
}

// =============================================================================
// Parameter Binding
// =============================================================================

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlParam::Null => ColumnData::String(None),
            SqlParam::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlParam::Int(i) => ColumnData::I64(Some(*i)),
            SqlParam::Float(f) => ColumnData::F64(Some(*f)),
            SqlParam::Text(s) => ColumnData::String(Some(s.as_str().into())),
        }
    }
}

// =============================================================================
// Type Names
// =============================================================================

/// SQL Server name for a wire column type. Used in result metadata only.
pub(crate) fn column_type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Null => "null",
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money => "money",
        ColumnType::Money4 => "smallmoney",
        ColumnType::Decimaln => "decimal",
        ColumnType::Numericn => "numeric",
        ColumnType::Datetime | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime4 => "smalldatetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::BigVarBin => "varbinary",
        ColumnType::BigBinary => "binary",
        ColumnType::Image => "image",
        ColumnType::BigVarChar => "varchar",
        ColumnType::BigChar => "char",
        ColumnType::NVarchar => "nvarchar",
        ColumnType::NChar => "nchar",
        ColumnType::Text => "text",
        ColumnType::NText => "ntext",
        ColumnType::Xml => "xml",
        _ => "unknown",
    }
}

// =============================================================================
// Value Conversion
// =============================================================================

fn row_to_json(row: Row) -> Vec<JsonValue> {
    row.into_iter().map(column_data_to_json).collect()
}

/// Convert one wire value to JSON.
///
/// Lossy conversions are avoided: DECIMAL/NUMERIC keep their exact decimal
/// representation as strings, GUIDs are hyphenated strings, binary is
/// base64, temporal values are ISO 8601.
pub(crate) fn column_data_to_json(data: ColumnData<'_>) -> JsonValue {
    match data {
        ColumnData::U8(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::I16(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::I32(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::I64(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::F32(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::F64(v) => v.map_or(JsonValue::Null, |n| json!(n)),
        ColumnData::Bit(v) => v.map_or(JsonValue::Null, |b| json!(b)),
        ColumnData::String(v) => v.map_or(JsonValue::Null, |s| json!(s.as_ref())),
        ColumnData::Guid(v) => v.map_or(JsonValue::Null, |g| json!(g.to_string())),
        ColumnData::Binary(v) => v.map_or(JsonValue::Null, |b| json!(BASE64.encode(b.as_ref()))),
        ColumnData::Numeric(v) => v.map_or(JsonValue::Null, |n| json!(n.to_string())),
        ColumnData::Xml(v) => v.map_or(JsonValue::Null, |x| json!(x.into_owned().into_string())),
        ColumnData::Date(v) => v.map_or(JsonValue::Null, |d| {
            json!(date_to_naive(d).format("%Y-%m-%d").to_string())
        }),
        ColumnData::Time(v) => v.map_or(JsonValue::Null, |t| {
            json!(time_to_naive(t).format("%H:%M:%S%.f").to_string())
        }),
        ColumnData::DateTime(v) => v.map_or(JsonValue::Null, |dt| {
            // fractional part counts 1/300ths of a second
            let nanos = i64::from(dt.seconds_fragments()) * 1_000_000_000 / 300;
            json!(render_datetime(datetime_from_1900(
                i64::from(dt.days()),
                nanos
            )))
        }),
        ColumnData::SmallDateTime(v) => v.map_or(JsonValue::Null, |dt| {
            // second field counts whole minutes since midnight
            let nanos = i64::from(dt.seconds_fragments()) * 60 * 1_000_000_000;
            json!(render_datetime(datetime_from_1900(
                i64::from(dt.days()),
                nanos
            )))
        }),
        ColumnData::DateTime2(v) => {
            v.map_or(JsonValue::Null, |dt| json!(render_datetime(datetime2_to_naive(dt))))
        }
        ColumnData::DateTimeOffset(v) => v.map_or(JsonValue::Null, |dto| {
            let offset_mins = dto.offset();
            let local = datetime2_to_naive(dto.datetime2())
                + ChronoDuration::minutes(i64::from(offset_mins));
            let sign = if offset_mins < 0 { '-' } else { '+' };
            let abs = offset_mins.unsigned_abs();
            json!(format!(
                "{}{}{:02}:{:02}",
                render_datetime(local),
                sign,
                abs / 60,
                abs % 60
            ))
        }),
    }
}

fn render_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// `date` counts days since 0001-01-01.
fn date_to_naive(date: Date) -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or_default() + ChronoDuration::days(i64::from(date.days()))
}

/// `time` counts 10^-scale second increments since midnight.
fn time_to_naive(time: Time) -> NaiveTime {
    let nanos = u128::from(time.increments())
        * 10u128.pow(9u32.saturating_sub(u32::from(time.scale())));
    NaiveTime::from_num_seconds_from_midnight_opt(
        (nanos / 1_000_000_000) as u32,
        (nanos % 1_000_000_000) as u32,
    )
    .unwrap_or_default()
}

fn datetime2_to_naive(dt: DateTime2) -> NaiveDateTime {
    let date = date_to_naive(dt.date());
    date.and_time(time_to_naive(dt.time()))
}

/// `datetime` and `smalldatetime` count days from 1900-01-01.
fn datetime_from_1900(days: i64, nanos: i64) -> NaiveDateTime {
    let date = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or_default() + ChronoDuration::days(days);
    date.and_time(NaiveTime::default()) + ChronoDuration::nanoseconds(nanos)
}
