//! Warm storage tier: PostgreSQL via sqlx.
//!
//! Holds the durable record of orders, trades, positions and per-pair
//! market data. Monetary columns are `NUMERIC(78,0)` bridged through
//! `BigDecimal`; all writes arrive from the asynchronous write-back worker,
//! never from the matching path.

use bigdecimal::BigDecimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::book::DepthLevel;
use crate::config::PostgresConfig;
use crate::error::CoreError;
use crate::models::position::SignedAmount;
use crate::models::{
    Order, OrderStatus, OrderType, Position, PositionSide, Side, TimeInForce, Trade, TradeQuery,
    UserOrdersQuery,
};
use crate::precision::Amount;

pub struct WarmStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: String,
    pair: String,
    order_type: OrderType,
    side: Side,
    quantity: BigDecimal,
    price: Option<BigDecimal>,
    stop_price: Option<BigDecimal>,
    time_in_force: String,
    post_only: bool,
    reduce_only: bool,
    leverage: i32,
    status: OrderStatus,
    filled: BigDecimal,
    remaining: BigDecimal,
    average_price: Option<BigDecimal>,
    fees: BigDecimal,
    quote_filled: BigDecimal,
    created_at: i64,
    updated_at: i64,
    linked_order_id: Option<Uuid>,
    parent_order_id: Option<Uuid>,
    visible_amount: Option<BigDecimal>,
    total_amount: Option<BigDecimal>,
    trail_distance: Option<BigDecimal>,
    slices: Option<i32>,
    duration_ms: Option<i64>,
    archive_ref: Option<String>,
    reject_reason: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: Uuid,
    pair: String,
    buy_order_id: Uuid,
    sell_order_id: Uuid,
    buyer_id: String,
    seller_id: String,
    price: BigDecimal,
    quantity: BigDecimal,
    quote_quantity: BigDecimal,
    fee: BigDecimal,
    fee_asset: String,
    timestamp: i64,
    sequence: i64,
    buyer_is_maker: bool,
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    user_id: String,
    contract: String,
    side: PositionSide,
    size: BigDecimal,
    entry_price: BigDecimal,
    mark_price: BigDecimal,
    leverage: i32,
    margin: BigDecimal,
    unrealized_pnl: BigDecimal,
    liquidation_price: BigDecimal,
    funding_payment: BigDecimal,
    last_funding_time: i64,
    updated_at: i64,
}

fn parse_tif(s: &str) -> TimeInForce {
    match s {
        "DAY" => TimeInForce::Day,
        "IOC" => TimeInForce::Ioc,
        "FOK" => TimeInForce::Fok,
        _ => TimeInForce::Gtc,
    }
}

fn amount(v: &BigDecimal) -> Result<Amount, CoreError> {
    Amount::from_numeric(v).map_err(|e| CoreError::Fatal(format!("corrupt numeric column: {e}")))
}

fn opt_amount(v: &Option<BigDecimal>) -> Result<Option<Amount>, CoreError> {
    v.as_ref().map(amount).transpose()
}

fn signed_to_numeric(v: &SignedAmount) -> BigDecimal {
    let magnitude = v.value.to_numeric();
    if v.is_negative() {
        -magnitude
    } else {
        magnitude
    }
}

fn numeric_to_signed(v: &BigDecimal) -> Result<SignedAmount, CoreError> {
    let negative = *v < BigDecimal::from(0);
    let magnitude = amount(&v.abs())?;
    Ok(if negative {
        SignedAmount::negative(magnitude)
    } else {
        SignedAmount::positive(magnitude)
    })
}

impl TryFrom<OrderRow> for Order {
    type Error = CoreError;

    fn try_from(r: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: r.id,
            user_id: r.user_id,
            pair: r.pair,
            order_type: r.order_type,
            side: r.side,
            quantity: amount(&r.quantity)?,
            price: opt_amount(&r.price)?,
            stop_price: opt_amount(&r.stop_price)?,
            time_in_force: parse_tif(&r.time_in_force),
            post_only: r.post_only,
            reduce_only: r.reduce_only,
            leverage: r.leverage.max(1) as u32,
            status: r.status,
            filled: amount(&r.filled)?,
            remaining: amount(&r.remaining)?,
            average_price: opt_amount(&r.average_price)?,
            fees: amount(&r.fees)?,
            timestamp: r.created_at,
            updated_at: r.updated_at,
            linked_order_id: r.linked_order_id,
            parent_order_id: r.parent_order_id,
            visible_amount: opt_amount(&r.visible_amount)?,
            total_amount: opt_amount(&r.total_amount)?,
            archive_ref: r.archive_ref,
            reject_reason: r.reject_reason,
            trail_distance: opt_amount(&r.trail_distance)?,
            slices: r.slices.map(|s| s.max(0) as u32),
            duration_ms: r.duration_ms,
            quote_filled: amount(&r.quote_filled)?,
        })
    }
}

impl TryFrom<TradeRow> for Trade {
    type Error = CoreError;

    fn try_from(r: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: r.id,
            pair: r.pair,
            buy_order_id: r.buy_order_id,
            sell_order_id: r.sell_order_id,
            buyer_id: r.buyer_id,
            seller_id: r.seller_id,
            price: amount(&r.price)?,
            quantity: amount(&r.quantity)?,
            quote_quantity: amount(&r.quote_quantity)?,
            fee: amount(&r.fee)?,
            fee_asset: r.fee_asset,
            buyer_is_maker: r.buyer_is_maker,
            timestamp: r.timestamp,
            sequence: r.sequence.max(0) as u64,
        })
    }
}

impl TryFrom<PositionRow> for Position {
    type Error = CoreError;

    fn try_from(r: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            user_id: r.user_id,
            contract: r.contract,
            side: r.side,
            size: amount(&r.size)?,
            entry_price: amount(&r.entry_price)?,
            mark_price: amount(&r.mark_price)?,
            leverage: r.leverage.max(1) as u32,
            margin: amount(&r.margin)?,
            unrealized_pnl: numeric_to_signed(&r.unrealized_pnl)?,
            liquidation_price: amount(&r.liquidation_price)?,
            funding_payment: numeric_to_signed(&r.funding_payment)?,
            last_funding_time: r.last_funding_time,
            updated_at: r.updated_at,
        })
    }
}

impl WarmStore {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max)
            .connect(&config.url())
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CoreError::Transient(format!("migration failed: {e}")))?;
        Ok(WarmStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Orders ====================

    pub async fn upsert_order(&self, order: &Order) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, pair, order_type, side, quantity, price, stop_price,
                time_in_force, post_only, reduce_only, leverage, status, filled,
                remaining, average_price, fees, quote_filled, created_at, updated_at,
                linked_order_id, parent_order_id, visible_amount, total_amount,
                trail_distance, slices, duration_ms, archive_ref, reject_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                filled = EXCLUDED.filled,
                remaining = EXCLUDED.remaining,
                average_price = EXCLUDED.average_price,
                fees = EXCLUDED.fees,
                quote_filled = EXCLUDED.quote_filled,
                stop_price = EXCLUDED.stop_price,
                visible_amount = EXCLUDED.visible_amount,
                updated_at = EXCLUDED.updated_at,
                archive_ref = COALESCE(orders.archive_ref, EXCLUDED.archive_ref),
                reject_reason = COALESCE(EXCLUDED.reject_reason, orders.reject_reason)
            "#,
        )
        .bind(order.id)
        .bind(&order.user_id)
        .bind(&order.pair)
        .bind(order.order_type)
        .bind(order.side)
        .bind(order.quantity.to_numeric())
        .bind(order.price.map(|p| p.to_numeric()))
        .bind(order.stop_price.map(|p| p.to_numeric()))
        .bind(order.time_in_force.to_string())
        .bind(order.post_only)
        .bind(order.reduce_only)
        .bind(order.leverage as i32)
        .bind(order.status)
        .bind(order.filled.to_numeric())
        .bind(order.remaining.to_numeric())
        .bind(order.average_price.map(|p| p.to_numeric()))
        .bind(order.fees.to_numeric())
        .bind(order.quote_filled.to_numeric())
        .bind(order.timestamp)
        .bind(order.updated_at)
        .bind(order.linked_order_id)
        .bind(order.parent_order_id)
        .bind(order.visible_amount.map(|p| p.to_numeric()))
        .bind(order.total_amount.map(|p| p.to_numeric()))
        .bind(order.trail_distance.map(|p| p.to_numeric()))
        .bind(order.slices.map(|s| s as i32))
        .bind(order.duration_ms)
        .bind(&order.archive_ref)
        .bind(&order.reject_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_order(&self, id: &Uuid) -> Result<Option<Order>, CoreError> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    /// Open and partially-filled orders for replay into the ladder at
    /// startup, in (created_at, id) arrival order.
    pub async fn fetch_open_orders(&self, pair: &str) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT * FROM orders
            WHERE pair = $1
              AND status IN ('open'::order_status, 'partially_filled'::order_status)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(pair)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    pub async fn fetch_user_orders(
        &self,
        user_id: &str,
        query: &UserOrdersQuery,
    ) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT * FROM orders
            WHERE user_id = $1
              AND ($2::text IS NULL OR pair = $2)
              AND ($3::order_status IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(query.pair.as_deref())
        .bind(query.status)
        .bind(query.limit() as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    /// Fill-state fingerprints for the reconciler.
    pub async fn fetch_order_states(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<(Uuid, OrderStatus, Amount)>, CoreError> {
        let rows: Vec<(Uuid, OrderStatus, BigDecimal)> = sqlx::query_as(
            "SELECT id, status, remaining FROM orders WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, status, remaining)| Ok((id, status, amount(&remaining)?)))
            .collect()
    }

    // ==================== Trades ====================

    pub async fn insert_trade(&self, trade: &Trade) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, pair, buy_order_id, sell_order_id, buyer_id, seller_id,
                price, quantity, quote_quantity, fee, fee_asset, buyer_is_maker,
                timestamp, sequence
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(&trade.pair)
        .bind(trade.buy_order_id)
        .bind(trade.sell_order_id)
        .bind(&trade.buyer_id)
        .bind(&trade.seller_id)
        .bind(trade.price.to_numeric())
        .bind(trade.quantity.to_numeric())
        .bind(trade.quote_quantity.to_numeric())
        .bind(trade.fee.to_numeric())
        .bind(&trade.fee_asset)
        .bind(trade.buyer_is_maker)
        .bind(trade.timestamp)
        .bind(trade.sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_trades(&self, pair: &str, limit: usize) -> Result<Vec<Trade>, CoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT id, pair, buy_order_id, sell_order_id, buyer_id, seller_id,
                   price, quantity, quote_quantity, fee, fee_asset, timestamp,
                   sequence, buyer_is_maker
            FROM trades WHERE pair = $1
            ORDER BY timestamp DESC LIMIT $2
            "#,
        )
        .bind(pair)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    pub async fn fetch_user_trades(
        &self,
        user_id: &str,
        query: &TradeQuery,
    ) -> Result<Vec<Trade>, CoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT id, pair, buy_order_id, sell_order_id, buyer_id, seller_id,
                   price, quantity, quote_quantity, fee, fee_asset, timestamp,
                   sequence, buyer_is_maker
            FROM trades
            WHERE (buyer_id = $1 OR seller_id = $1)
              AND ($2::text IS NULL OR pair = $2)
              AND ($3::bigint IS NULL OR timestamp < $3)
              AND ($4::bigint IS NULL OR timestamp > $4)
            ORDER BY timestamp DESC LIMIT $5
            "#,
        )
        .bind(user_id)
        .bind(query.pair.as_deref())
        .bind(query.before)
        .bind(query.after)
        .bind(query.limit() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    pub async fn mark_trade_on_chain(
        &self,
        trade_id: &Uuid,
        status: &str,
        tx_ref: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE trades SET on_chain = $1, tx_ref = COALESCE($2, tx_ref) WHERE id = $3")
            .bind(status)
            .bind(tx_ref)
            .bind(trade_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Book aggregation (read fallback) ====================

    /// Rebuild a depth view from open orders when no hot ladder exists:
    /// group by `(side, price)`, sum remaining, order per side.
    pub async fn aggregate_book(
        &self,
        pair: &str,
        depth: usize,
    ) -> Result<(Vec<DepthLevel>, Vec<DepthLevel>), CoreError> {
        let bids = self.aggregate_side(pair, Side::Buy, depth).await?;
        let asks = self.aggregate_side(pair, Side::Sell, depth).await?;
        Ok((bids, asks))
    }

    async fn aggregate_side(
        &self,
        pair: &str,
        side: Side,
        depth: usize,
    ) -> Result<Vec<DepthLevel>, CoreError> {
        let order_clause = match side {
            Side::Buy => "ORDER BY price DESC",
            Side::Sell => "ORDER BY price ASC",
        };
        let sql = format!(
            r#"
            SELECT price, SUM(remaining) AS quantity, COUNT(*) AS order_count
            FROM orders
            WHERE pair = $1 AND side = $2 AND price IS NOT NULL
              AND status IN ('open'::order_status, 'partially_filled'::order_status)
            GROUP BY price {order_clause} LIMIT $3
            "#
        );
        let rows: Vec<(BigDecimal, BigDecimal, i64)> = sqlx::query_as(&sql)
            .bind(pair)
            .bind(side)
            .bind(depth as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(price, quantity, count)| {
                Ok(DepthLevel {
                    price: amount(&price)?,
                    quantity: amount(&quantity)?,
                    order_count: count.max(0) as usize,
                })
            })
            .collect()
    }

    // ==================== Positions ====================

    pub async fn upsert_position(&self, p: &Position) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                user_id, contract, side, size, entry_price, mark_price, leverage,
                margin, unrealized_pnl, liquidation_price, funding_payment,
                last_funding_time, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, contract) DO UPDATE SET
                side = EXCLUDED.side,
                size = EXCLUDED.size,
                entry_price = EXCLUDED.entry_price,
                mark_price = EXCLUDED.mark_price,
                leverage = EXCLUDED.leverage,
                margin = EXCLUDED.margin,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                liquidation_price = EXCLUDED.liquidation_price,
                funding_payment = EXCLUDED.funding_payment,
                last_funding_time = EXCLUDED.last_funding_time,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&p.user_id)
        .bind(&p.contract)
        .bind(p.side)
        .bind(p.size.to_numeric())
        .bind(p.entry_price.to_numeric())
        .bind(p.mark_price.to_numeric())
        .bind(p.leverage as i32)
        .bind(p.margin.to_numeric())
        .bind(signed_to_numeric(&p.unrealized_pnl))
        .bind(p.liquidation_price.to_numeric())
        .bind(signed_to_numeric(&p.funding_payment))
        .bind(p.last_funding_time)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_positions(&self, user_id: &str) -> Result<Vec<Position>, CoreError> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE user_id = $1 AND size > 0",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Position::try_from).collect()
    }

    pub async fn delete_position(&self, user_id: &str, contract: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM positions WHERE user_id = $1 AND contract = $2")
            .bind(user_id)
            .bind(contract)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Market data ====================

    pub async fn upsert_market_data(
        &self,
        pair: &str,
        sequence: u64,
        best_bid: Option<Amount>,
        best_ask: Option<Amount>,
        last_price: Option<Amount>,
        now: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_data (pair, sequence, best_bid, best_ask, last_price, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (pair) DO UPDATE SET
                sequence = GREATEST(market_data.sequence, EXCLUDED.sequence),
                best_bid = EXCLUDED.best_bid,
                best_ask = EXCLUDED.best_ask,
                last_price = COALESCE(EXCLUDED.last_price, market_data.last_price),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(pair)
        .bind(sequence as i64)
        .bind(best_bid.map(|a| a.to_numeric()))
        .bind(best_ask.map(|a| a.to_numeric()))
        .bind(last_price.map(|a| a.to_numeric()))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_sequence(&self, pair: &str) -> Result<u64, CoreError> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT sequence FROM market_data WHERE pair = $1")
                .bind(pair)
                .fetch_optional(&self.pool)
                .await?;
        Ok(seq.unwrap_or(0).max(0) as u64)
    }

    // ==================== Archival ====================

    /// Terminal orders past the archival threshold, oldest first.
    pub async fn fetch_archivable(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT * FROM orders
            WHERE archive_ref IS NULL
              AND status IN ('filled'::order_status, 'cancelled'::order_status,
                             'expired'::order_status, 'rejected'::order_status)
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    pub async fn mark_archived(&self, ids: &[Uuid], archive_ref: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE orders SET archive_ref = $1 WHERE id = ANY($2)")
            .bind(archive_ref)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Settlement outbox ====================

    pub async fn insert_settlement_intent(
        &self,
        id: &str,
        kind: &str,
        calldata: &[u8],
        now: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlement_intents (id, kind, calldata, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(calldata)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_settlement_intent(
        &self,
        id: &str,
        status: &str,
        attempts: u32,
        tx_ref: Option<&str>,
        now: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE settlement_intents
            SET status = $1, attempts = $2, tx_ref = COALESCE($3, tx_ref), updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(status)
        .bind(attempts as i32)
        .bind(tx_ref)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending intents to replay after a restart.
    pub async fn fetch_pending_intents(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, String, Vec<u8>, i32)>, CoreError> {
        let rows: Vec<(String, String, Vec<u8>, i32)> = sqlx::query_as(
            r#"
            SELECT id, kind, calldata, attempts FROM settlement_intents
            WHERE status = 'pending'
            ORDER BY created_at ASC LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    // Query paths require a live PostgreSQL instance and are exercised by
    // deployment smoke tests; the pure conversion helpers are covered here.
    use super::*;

    #[test]
    fn tif_round_trip() {
        for tif in [
            TimeInForce::Gtc,
            TimeInForce::Day,
            TimeInForce::Ioc,
            TimeInForce::Fok,
        ] {
            assert_eq!(parse_tif(&tif.to_string()), tif);
        }
        assert_eq!(parse_tif("garbage"), TimeInForce::Gtc);
    }

    #[test]
    fn signed_numeric_round_trip() {
        let neg = SignedAmount::negative(Amount::from_u64(42));
        let n = signed_to_numeric(&neg);
        assert!(n < BigDecimal::from(0));
        let back = numeric_to_signed(&n).unwrap();
        assert_eq!(back, neg);

        let pos = SignedAmount::positive(Amount::from_u64(7));
        assert_eq!(numeric_to_signed(&signed_to_numeric(&pos)).unwrap(), pos);
    }
}
