//! PostgREST-backed store.
//!
//! Talks to the hosted back office database through its REST endpoint
//! (`/rest/v1/<table>`). Table and column names are the back office's own.
//! Every call commits on its own; there is no unit of work here, so a failed
//! submission may leave earlier steps persisted and the orchestrator reports
//! them as such.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::store::{
    Attendant, ClosingKey, ClosingRecord, ClosingStatus, ClosingUpdate, NewAttendantSession,
    NewClosing, NewReading, NewReceipt, NozzleDetail, PaymentMethod, PersistentStore,
    ReadingRecord, ReceiptRecord, SessionRecord, StoreError, StoreResult,
};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many recent rows to scan for a nozzle's last valid reading.
const LAST_READING_SCAN: usize = 20;

const T_CLOSING: &str = "Fechamento";
const T_READING: &str = "Leitura";
const T_SESSION: &str = "FechamentoFrentista";
const T_RECEIPT: &str = "Recebimento";
const T_PAYMENT_METHOD: &str = "FormaPagamento";
const T_ATTENDANT: &str = "Frentista";
const T_NOZZLE: &str = "Bico";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the back office URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> StoreError {
    let message = if err.is_connect() {
        format!("Cannot reach back office at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid back office URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    StoreError::Unavailable(message)
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for this location".to_string(),
        404 => "Back office table not found".to_string(),
        409 => "Conflicting row already exists".to_string(),
        s if s >= 500 => format!("Back office server error (HTTP {s})"),
        s => format!("Unexpected response from back office (HTTP {s})"),
    }
}

/// Build an error from a failed response, keeping PostgREST's own message
/// and details when the body carries them.
fn response_error(status: StatusCode, body_text: &str) -> StoreError {
    let trimmed = body_text.trim();
    let message = match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_error(status));
            match json.get("details").filter(|d| !d.is_null()) {
                Some(details) => format!("{message} (HTTP {}): {details}", status.as_u16()),
                None => format!("{message} (HTTP {})", status.as_u16()),
            }
        }
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_error(status)),
        Err(_) => status_error(status),
    };
    StoreError::Http {
        status: Some(status.as_u16()),
        message,
    }
}

// ---------------------------------------------------------------------------
// Wire rows
// ---------------------------------------------------------------------------

fn first_version() -> i64 {
    1
}

fn parse_day(text: &str) -> StoreResult<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| StoreError::Serialization(format!("bad date {text}: {e}")))
}

fn actor_string(v: Option<Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[derive(Deserialize)]
struct ClosingRow {
    id: i64,
    data: String,
    turno_id: Option<i64>,
    posto_id: i64,
    status: String,
    #[serde(default)]
    total_vendas: Decimal,
    #[serde(default)]
    total_recebido: Decimal,
    #[serde(default)]
    diferenca: Decimal,
    observacoes: Option<String>,
    #[serde(default)]
    usuario_id: Option<Value>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<String>,
    #[serde(default = "first_version")]
    version: i64,
}

impl ClosingRow {
    fn into_record(self) -> StoreResult<ClosingRecord> {
        let status = ClosingStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown closing status {}", self.status))
        })?;
        Ok(ClosingRecord {
            id: self.id,
            date: parse_day(&self.data)?,
            shift_id: self.turno_id.unwrap_or_default(),
            location_id: self.posto_id,
            status,
            total_sales: self.total_vendas,
            total_collected: self.total_recebido,
            difference: self.diferenca,
            observations: self.observacoes,
            created_by: actor_string(self.usuario_id),
            created_at: self.created_at.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or_default(),
            version: self.version,
        })
    }
}

#[derive(Deserialize)]
struct ReadingRow {
    id: i64,
    bico_id: i64,
    data: String,
    turno_id: Option<i64>,
    posto_id: i64,
    leitura_inicial: Decimal,
    leitura_final: Decimal,
    combustivel_id: i64,
    preco_litro: Decimal,
    #[serde(default)]
    usuario_id: Option<Value>,
}

impl ReadingRow {
    fn into_record(self) -> StoreResult<ReadingRecord> {
        Ok(ReadingRecord {
            id: self.id,
            nozzle_id: self.bico_id,
            date: parse_day(&self.data)?,
            shift_id: self.turno_id,
            location_id: self.posto_id,
            initial_reading: self.leitura_inicial,
            final_reading: self.leitura_final,
            fuel_id: self.combustivel_id,
            unit_price: self.preco_litro,
            actor_id: actor_string(self.usuario_id),
        })
    }
}

#[derive(Deserialize)]
struct SessionRow {
    id: i64,
    fechamento_id: i64,
    frentista_id: i64,
    posto_id: i64,
    #[serde(default)]
    valor_dinheiro: Decimal,
    #[serde(default)]
    valor_pix: Decimal,
    #[serde(default)]
    valor_cartao_debito: Decimal,
    #[serde(default)]
    valor_cartao_credito: Decimal,
    #[serde(default)]
    valor_cartao: Decimal,
    #[serde(default)]
    valor_nota: Decimal,
    #[serde(default)]
    baratao: Decimal,
    encerrante: Option<Decimal>,
    diferenca_calculada: Option<Decimal>,
    #[serde(default)]
    valor_conferido: Decimal,
    observacoes: Option<String>,
}

impl From<SessionRow> for SessionRecord {
    fn from(r: SessionRow) -> Self {
        SessionRecord {
            id: r.id,
            row: NewAttendantSession {
                closing_id: r.fechamento_id,
                location_id: r.posto_id,
                attendant_id: r.frentista_id,
                cash: r.valor_dinheiro,
                instant_transfer: r.valor_pix,
                debit_card: r.valor_cartao_debito,
                credit_card: r.valor_cartao_credito,
                credit_note: r.valor_nota,
                voucher: r.baratao,
                card_total: r.valor_cartao,
                metered_amount: r.encerrante.unwrap_or_default(),
                difference: r.diferenca_calculada.unwrap_or_default(),
                verified_amount: r.valor_conferido,
                products_amount: Decimal::ZERO,
                observations: r.observacoes.filter(|o| !o.is_empty()),
            },
        }
    }
}

#[derive(Deserialize)]
struct ReceiptRow {
    id: i64,
    fechamento_id: i64,
    forma_pagamento_id: i64,
    valor: Decimal,
    #[serde(default)]
    observacoes: Option<String>,
}

#[derive(Deserialize)]
struct PaymentMethodRow {
    id: i64,
    nome: String,
    #[serde(default)]
    tipo: String,
    taxa: Option<Decimal>,
    ativo: bool,
}

#[derive(Deserialize)]
struct AttendantRow {
    id: i64,
    nome: String,
    ativo: bool,
}

#[derive(Deserialize)]
struct FuelRow {
    id: i64,
    nome: String,
    codigo: String,
    preco_venda: Decimal,
}

#[derive(Deserialize)]
struct NozzleRow {
    id: i64,
    numero: i64,
    posto_id: i64,
    combustivel: FuelRow,
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key: api_key.to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> StoreResult<Value> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        debug!(%method, table, "back office request");

        let mut req = self
            .client
            .request(method, &url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
            .query(query);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = response_error(status, &body_text);
            warn!(table, status = status.as_u16(), error = %err, "back office request failed");
            return Err(err);
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        serde_json::from_str(&body_text)
            .map_err(|e| StoreError::Serialization(format!("Invalid JSON from {table}: {e}")))
    }

    async fn rows<T: DeserializeOwned>(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> StoreResult<Vec<T>> {
        let value = self.send(method, table, query, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_where(&self, table: &str, query: &[(&str, String)]) -> StoreResult<u64> {
        let deleted: Vec<Value> = self.rows(Method::DELETE, table, query, None).await?;
        Ok(deleted.len() as u64)
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let inserted: Vec<Value> = self
            .rows(Method::POST, table, &[], Some(Value::Array(rows)))
            .await?;
        Ok(inserted.len() as u64)
    }

    async fn closing_by_id(&self, id: i64) -> StoreResult<Option<ClosingRecord>> {
        let rows: Vec<ClosingRow> = self
            .rows(Method::GET, T_CLOSING, &[("id", eq(id))], None)
            .await?;
        rows.into_iter().next().map(ClosingRow::into_record).transpose()
    }
}

impl PersistentStore for RemoteStore {
    async fn find_closing(&self, key: &ClosingKey) -> StoreResult<Option<ClosingRecord>> {
        let day = key.date.format("%Y-%m-%d");
        let rows: Vec<ClosingRow> = self
            .rows(
                Method::GET,
                T_CLOSING,
                &[
                    ("data", format!("gte.{day}T00:00:00")),
                    ("data", format!("lte.{day}T23:59:59")),
                    ("turno_id", eq(key.shift_id)),
                    ("posto_id", eq(key.location_id)),
                    ("order", "id.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
                None,
            )
            .await?;
        rows.into_iter().next().map(ClosingRow::into_record).transpose()
    }

    async fn create_closing(&self, fields: &NewClosing) -> StoreResult<ClosingRecord> {
        let body = json!({
            "data": fields.key.date.format("%Y-%m-%d").to_string(),
            "turno_id": fields.key.shift_id,
            "posto_id": fields.key.location_id,
            "status": fields.status.as_str(),
            "usuario_id": fields.created_by,
            "total_vendas": 0,
            "total_recebido": 0,
            "diferenca": 0,
        });
        let rows: Vec<ClosingRow> = self.rows(Method::POST, T_CLOSING, &[], Some(body)).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Serialization("closing insert returned no row".into()))?
            .into_record()
    }

    async fn update_closing(&self, id: i64, fields: &ClosingUpdate) -> StoreResult<ClosingRecord> {
        let base_version = match fields.expected_version {
            Some(v) => v,
            None => {
                self.closing_by_id(id)
                    .await?
                    .ok_or(StoreError::NotFound {
                        entity: "closing",
                        id: id.to_string(),
                    })?
                    .version
            }
        };

        let mut query = vec![("id", eq(id))];
        if fields.expected_version.is_some() {
            query.push(("version", eq(base_version)));
        }
        let body = json!({
            "status": fields.status.as_str(),
            "total_vendas": fields.total_sales,
            "total_recebido": fields.total_collected,
            "diferenca": fields.difference,
            "observacoes": fields.observations,
            "version": base_version + 1,
        });
        let rows: Vec<ClosingRow> = self.rows(Method::PATCH, T_CLOSING, &query, Some(body)).await?;
        if let Some(row) = rows.into_iter().next() {
            return row.into_record();
        }

        match self.closing_by_id(id).await? {
            Some(current) => Err(StoreError::VersionConflict {
                closing_id: id,
                expected: base_version,
                found: Some(current.version),
            }),
            None => Err(StoreError::NotFound {
                entity: "closing",
                id: id.to_string(),
            }),
        }
    }

    async fn delete_readings(&self, key: &ClosingKey) -> StoreResult<u64> {
        self.delete_where(
            T_READING,
            &[
                ("data", eq(key.date.format("%Y-%m-%d"))),
                ("turno_id", eq(key.shift_id)),
                ("posto_id", eq(key.location_id)),
            ],
        )
        .await
    }

    async fn bulk_create_readings(&self, rows: &[NewReading]) -> StoreResult<u64> {
        let body = rows
            .iter()
            .map(|r| {
                json!({
                    "bico_id": r.nozzle_id,
                    "data": r.date.format("%Y-%m-%d").to_string(),
                    "leitura_inicial": r.initial_reading,
                    "leitura_final": r.final_reading,
                    "combustivel_id": r.fuel_id,
                    "preco_litro": r.unit_price,
                    "usuario_id": r.actor_id,
                    "turno_id": r.shift_id,
                    "posto_id": r.location_id,
                })
            })
            .collect();
        self.insert(T_READING, body).await
    }

    async fn find_last_reading(
        &self,
        nozzle_id: i64,
        location_id: i64,
    ) -> StoreResult<Option<ReadingRecord>> {
        let rows: Vec<ReadingRow> = self
            .rows(
                Method::GET,
                T_READING,
                &[
                    ("bico_id", eq(nozzle_id)),
                    ("posto_id", eq(location_id)),
                    ("order", "data.desc,id.desc".to_string()),
                    ("limit", LAST_READING_SCAN.to_string()),
                ],
                None,
            )
            .await?;
        for row in rows {
            let reading = row.into_record()?;
            if reading.final_reading > reading.initial_reading && !reading.final_reading.is_zero() {
                return Ok(Some(reading));
            }
        }
        Ok(None)
    }

    async fn find_readings(
        &self,
        date: NaiveDate,
        shift_id: Option<i64>,
        location_id: i64,
    ) -> StoreResult<Vec<ReadingRecord>> {
        let mut query = vec![
            ("data", eq(date.format("%Y-%m-%d"))),
            ("posto_id", eq(location_id)),
            ("order", "bico_id.asc,id.asc".to_string()),
        ];
        if let Some(shift) = shift_id {
            query.push(("turno_id", eq(shift)));
        }
        let rows: Vec<ReadingRow> = self.rows(Method::GET, T_READING, &query, None).await?;
        rows.into_iter().map(ReadingRow::into_record).collect()
    }

    async fn find_attendant_sessions(&self, closing_id: i64) -> StoreResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = self
            .rows(
                Method::GET,
                T_SESSION,
                &[
                    ("fechamento_id", eq(closing_id)),
                    ("order", "id.asc".to_string()),
                ],
                None,
            )
            .await?;
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    async fn delete_attendant_sessions(&self, closing_id: i64) -> StoreResult<u64> {
        self.delete_where(T_SESSION, &[("fechamento_id", eq(closing_id))])
            .await
    }

    async fn bulk_create_attendant_sessions(
        &self,
        rows: &[NewAttendantSession],
    ) -> StoreResult<u64> {
        let body = rows
            .iter()
            .map(|s| {
                json!({
                    "fechamento_id": s.closing_id,
                    "frentista_id": s.attendant_id,
                    "valor_cartao": s.card_total,
                    "valor_cartao_debito": s.debit_card,
                    "valor_cartao_credito": s.credit_card,
                    "valor_dinheiro": s.cash,
                    "valor_pix": s.instant_transfer,
                    "valor_nota": s.credit_note,
                    "baratao": s.voucher,
                    "encerrante": s.metered_amount,
                    "diferenca_calculada": s.difference,
                    "valor_conferido": s.verified_amount,
                    "observacoes": s.observations.clone().unwrap_or_default(),
                    "posto_id": s.location_id,
                })
            })
            .collect();
        self.insert(T_SESSION, body).await
    }

    async fn find_receipts(&self, closing_id: i64) -> StoreResult<Vec<ReceiptRecord>> {
        let rows: Vec<ReceiptRow> = self
            .rows(
                Method::GET,
                T_RECEIPT,
                &[("fechamento_id", eq(closing_id))],
                None,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ReceiptRecord {
                id: r.id,
                closing_id: r.fechamento_id,
                payment_method_id: r.forma_pagamento_id,
                amount: r.valor,
                observations: r.observacoes,
            })
            .collect())
    }

    async fn delete_receipts(&self, closing_id: i64) -> StoreResult<u64> {
        self.delete_where(T_RECEIPT, &[("fechamento_id", eq(closing_id))])
            .await
    }

    async fn bulk_create_receipts(&self, rows: &[NewReceipt]) -> StoreResult<u64> {
        let body = rows
            .iter()
            .map(|r| {
                json!({
                    "fechamento_id": r.closing_id,
                    "forma_pagamento_id": r.payment_method_id,
                    "valor": r.amount,
                    "observacoes": r.observations,
                })
            })
            .collect();
        self.insert(T_RECEIPT, body).await
    }

    async fn list_active_payment_methods(&self, location_id: i64) -> StoreResult<Vec<PaymentMethod>> {
        let rows: Vec<PaymentMethodRow> = self
            .rows(
                Method::GET,
                T_PAYMENT_METHOD,
                &[
                    ("posto_id", eq(location_id)),
                    ("ativo", eq(true)),
                    ("order", "id.asc".to_string()),
                ],
                None,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| PaymentMethod {
                id: m.id,
                name: m.nome,
                kind: m.tipo,
                fee_percent: m.taxa.unwrap_or_default(),
                active: m.ativo,
            })
            .collect())
    }

    async fn list_active_attendants(&self, location_id: i64) -> StoreResult<Vec<Attendant>> {
        let rows: Vec<AttendantRow> = self
            .rows(
                Method::GET,
                T_ATTENDANT,
                &[
                    ("posto_id", eq(location_id)),
                    ("ativo", eq(true)),
                    ("order", "nome.asc".to_string()),
                ],
                None,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|a| Attendant {
                id: a.id,
                name: a.nome,
                active: a.ativo,
            })
            .collect())
    }

    async fn list_nozzles_with_fuel_and_price(
        &self,
        location_id: i64,
    ) -> StoreResult<Vec<NozzleDetail>> {
        let rows: Vec<NozzleRow> = self
            .rows(
                Method::GET,
                T_NOZZLE,
                &[
                    (
                        "select",
                        "id,numero,posto_id,combustivel:Combustivel(id,nome,codigo,preco_venda)"
                            .to_string(),
                    ),
                    ("posto_id", eq(location_id)),
                    ("ativo", eq(true)),
                    ("order", "numero.asc".to_string()),
                ],
                None,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|n| NozzleDetail {
                id: n.id,
                number: n.numero,
                location_id: n.posto_id,
                fuel_id: n.combustivel.id,
                fuel_name: n.combustivel.nome,
                fuel_code: n.combustivel.codigo,
                unit_price: n.combustivel.preco_venda,
            })
            .collect())
    }
}
