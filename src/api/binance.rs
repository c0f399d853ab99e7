use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{Exchange, ExchangeError};
use crate::config::ExchangeSettings;
use crate::models::{
    AckState, AssetBalance, ClientRequestId, ExchangeOrder, ExchangeOrderStatus, OrderAck,
    OrderIntent, OrderKind, Position, PriceBar, Side,
};

// Binance USDⓈ-M futures REST API
// Docs: https://developers.binance.com/docs/derivatives/usds-margined-futures
pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

const TIMESTAMP_ERROR_CODE: i64 = -1021;
const UNKNOWN_ORDER_CODE: i64 = -2013;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// REST adapter for Binance futures
///
/// Cloneable; clones share the HTTP connection pool and rate limiter.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    honors_idempotency_keys: bool,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    symbol: String,
    order_id: u64,
    #[serde(default)]
    client_order_id: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    orig_qty: String,
    #[serde(default)]
    price: String,
    executed_qty: String,
    #[serde(default)]
    avg_price: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskResponse {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    #[serde(default)]
    leverage: String,
    #[serde(default)]
    notional: String,
    #[serde(default)]
    isolated_margin: String,
    #[serde(default)]
    margin_type: String,
}

#[derive(Debug, Deserialize)]
struct TickerPriceResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    asset: String,
    balance: String,
    available_balance: String,
    #[serde(default)]
    cross_un_pnl: String,
}

impl BinanceFuturesClient {
    pub fn new(settings: &ExchangeSettings) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| ExchangeError::Malformed(format!("failed to build HTTP client: {}", e)))?;

        let per_minute =
            NonZeroU32::new(settings.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

        Ok(Self {
            client,
            base_url: settings.resolved_base_url(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            honors_idempotency_keys: settings.honors_idempotency_keys,
            rate_limiter,
        })
    }

    /// HMAC-SHA256 of the query string, hex encoded
    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Malformed(format!("invalid api secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let query = Self::encode(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        self.send(Method::GET, url, false).await
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        timestamp_ms: i64,
    ) -> Result<String, ExchangeError> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", timestamp_ms.to_string()));
        let query = Self::encode(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        self.send(method, url, true).await
    }

    async fn send(&self, method: Method, url: String, signed: bool) -> Result<String, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let mut request = self.client.request(method.clone(), &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(ExchangeError::undelivered(format!("connect error: {}", e)))
            }
            Err(e) if e.is_timeout() => {
                return Err(ExchangeError::transient(format!("request timed out: {}", e)))
            }
            Err(e) => return Err(ExchangeError::transient(e.to_string())),
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::transient(format!("failed to read body: {}", e)))?;

        if status.is_success() {
            return Ok(body);
        }

        // 5xx: execution status unknown
        if status.is_server_error() {
            tracing::warn!(%method, status = %status, "Server error from Binance");
            return Err(ExchangeError::transient(format!("server error {}: {}", status, body)));
        }

        match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(err) if err.code == TIMESTAMP_ERROR_CODE => Err(ExchangeError::TimestampOutOfSync),
            Ok(err) => Err(ExchangeError::Rejected {
                code: err.code,
                message: err.msg,
            }),
            Err(_) => Err(ExchangeError::Rejected {
                code: -(status.as_u16() as i64),
                message: body,
            }),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ExchangeError> {
        serde_json::from_str(body).map_err(|e| ExchangeError::Malformed(e.to_string()))
    }
}

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse()
        .map_err(|_| ExchangeError::Malformed(format!("{} is not a number: {:?}", field, value)))
}

fn parse_status(status: &str) -> Option<ExchangeOrderStatus> {
    match status {
        "NEW" => Some(ExchangeOrderStatus::New),
        "PARTIALLY_FILLED" => Some(ExchangeOrderStatus::PartiallyFilled),
        "FILLED" => Some(ExchangeOrderStatus::Filled),
        "CANCELED" => Some(ExchangeOrderStatus::Canceled),
        "REJECTED" => Some(ExchangeOrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Some(ExchangeOrderStatus::Expired),
        _ => None,
    }
}

impl OrderResponse {
    fn into_exchange_order(self) -> Result<ExchangeOrder, ExchangeError> {
        let status = parse_status(&self.status)
            .ok_or_else(|| ExchangeError::Malformed(format!("unknown order status {}", self.status)))?;
        let side = match self.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => return Err(ExchangeError::Malformed(format!("unknown side {}", other))),
        };
        let kind = if self.order_type == "LIMIT" {
            OrderKind::Limit
        } else {
            OrderKind::Market
        };

        Ok(ExchangeOrder {
            quantity: parse_f64(&self.orig_qty, "origQty")?,
            price: parse_f64(&self.price, "price")?,
            filled_quantity: parse_f64(&self.executed_qty, "executedQty")?,
            avg_fill_price: parse_f64(&self.avg_price, "avgPrice")?,
            symbol: self.symbol,
            exchange_order_id: self.order_id.to_string(),
            client_request_id: if self.client_order_id.is_empty() {
                None
            } else {
                Some(ClientRequestId::from(self.client_order_id))
            },
            side,
            kind,
            status,
        })
    }

    fn into_ack(self) -> Result<OrderAck, ExchangeError> {
        let order = self.into_exchange_order()?;
        let ack = match order.status {
            ExchangeOrderStatus::Rejected | ExchangeOrderStatus::Expired => {
                AckState::Rejected(format!("order {:?}", order.status))
            }
            _ => AckState::Accepted,
        };

        Ok(OrderAck {
            exchange_order_id: Some(order.exchange_order_id),
            ack,
            status: Some(order.status),
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
        })
    }
}

impl PositionRiskResponse {
    fn into_position(self) -> Result<Position, ExchangeError> {
        let net_quantity = parse_f64(&self.position_amt, "positionAmt")?;
        let entry_price = parse_f64(&self.entry_price, "entryPrice")?;
        let mark_price = parse_f64(&self.mark_price, "markPrice")?;
        let leverage = parse_f64(&self.leverage, "leverage")?;
        let notional = parse_f64(&self.notional, "notional")?;

        let margin_used = if self.margin_type == "isolated" {
            parse_f64(&self.isolated_margin, "isolatedMargin")?
        } else if leverage > 0.0 {
            notional.abs() / leverage
        } else {
            0.0
        };

        Ok(Position {
            symbol: self.symbol,
            net_quantity,
            entry_price,
            mark_price,
            unrealized_pnl: parse_f64(&self.unrealized_profit, "unRealizedProfit")?,
            margin_used,
            updated_at: Utc::now(),
        })
    }
}

fn parse_kline(row: &[serde_json::Value]) -> Result<PriceBar, ExchangeError> {
    let field = |idx: usize, name: &str| -> Result<f64, ExchangeError> {
        match row.get(idx) {
            Some(serde_json::Value::String(s)) => parse_f64(s, name),
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ExchangeError::Malformed(format!("bad {}", name))),
            _ => Err(ExchangeError::Malformed(format!("kline missing {}", name))),
        }
    };

    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::Malformed("kline missing open time".to_string()))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| ExchangeError::Malformed(format!("bad kline open time {}", open_time)))?;

    Ok(PriceBar {
        timestamp,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    fn name(&self) -> &str {
        "binance-futures"
    }

    fn honors_idempotency_keys(&self) -> bool {
        self.honors_idempotency_keys
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        let body = self.public("/fapi/v1/time", &[]).await?;
        let response: ServerTimeResponse = Self::decode(&body)?;
        Ok(response.server_time)
    }

    async fn place_order(
        &self,
        intent: &OrderIntent,
        timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", intent.symbol.clone()),
            ("side", intent.side.as_str().to_string()),
            ("type", intent.kind.as_str().to_string()),
            ("quantity", intent.quantity.to_string()),
            ("newClientOrderId", intent.client_request_id.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if let (OrderKind::Limit, Some(price)) = (intent.kind, intent.limit_price) {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if intent.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        tracing::info!(
            symbol = %intent.symbol,
            client_request_id = %intent.client_request_id,
            side = %intent.side,
            quantity = intent.quantity,
            "Placing order on Binance"
        );

        let body = self.signed(Method::POST, "/fapi/v1/order", params, timestamp_ms).await?;
        Self::decode::<OrderResponse>(&body)?.into_ack()
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
        idempotency_key: &ClientRequestId,
        timestamp_ms: i64,
    ) -> Result<OrderAck, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("orderId", exchange_order_id.to_string()),
            ("origClientOrderId", idempotency_key.to_string()),
        ];
        let body = self.signed(Method::DELETE, "/fapi/v1/order", params, timestamp_ms).await?;
        Self::decode::<OrderResponse>(&body)?.into_ack()
    }

    async fn get_order(
        &self,
        symbol: &str,
        client_request_id: &ClientRequestId,
        timestamp_ms: i64,
    ) -> Result<Option<ExchangeOrder>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("origClientOrderId", client_request_id.to_string()),
        ];
        match self.signed(Method::GET, "/fapi/v1/order", params, timestamp_ms).await {
            Ok(body) => Ok(Some(Self::decode::<OrderResponse>(&body)?.into_exchange_order()?)),
            Err(ExchangeError::Rejected { code, .. }) if code == UNKNOWN_ORDER_CODE => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(
        &self,
        symbol: Option<&str>,
        timestamp_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let params = symbol
            .map(|s| vec![("symbol", s.to_uppercase())])
            .unwrap_or_default();
        let body = self
            .signed(Method::GET, "/fapi/v1/openOrders", params, timestamp_ms)
            .await?;
        Self::decode::<Vec<OrderResponse>>(&body)?
            .into_iter()
            .map(OrderResponse::into_exchange_order)
            .collect()
    }

    async fn positions(&self, timestamp_ms: i64) -> Result<Vec<Position>, ExchangeError> {
        let body = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new(), timestamp_ms)
            .await?;
        Self::decode::<Vec<PositionRiskResponse>>(&body)?
            .into_iter()
            .map(PositionRiskResponse::into_position)
            .collect()
    }

    async fn balances(&self, timestamp_ms: i64) -> Result<Vec<AssetBalance>, ExchangeError> {
        let body = self
            .signed(Method::GET, "/fapi/v2/balance", Vec::new(), timestamp_ms)
            .await?;
        Self::decode::<Vec<BalanceResponse>>(&body)?
            .into_iter()
            .map(|b| {
                Ok(AssetBalance {
                    balance: parse_f64(&b.balance, "balance")?,
                    available_balance: parse_f64(&b.available_balance, "availableBalance")?,
                    unrealized_pnl: parse_f64(&b.cross_un_pnl, "crossUnPnl")?,
                    asset: b.asset,
                })
            })
            .collect()
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<PriceBar>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.to_string()),
            // One extra: the newest kline is still forming
            ("limit", (limit as u32 + 1).to_string()),
        ];
        let body = self.public("/fapi/v1/klines", &params).await?;
        let rows: Vec<Vec<serde_json::Value>> = Self::decode(&body)?;

        let mut bars = rows
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>, _>>()?;
        bars.pop();
        Ok(bars)
    }

    async fn ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .public("/fapi/v1/ticker/price", &[("symbol", symbol.to_uppercase())])
            .await?;
        let response: TickerPriceResponse = Self::decode(&body)?;
        parse_f64(&response.price, "price")
    }
}
