//! Ingress validation and the price-band guard.
//!
//! Validation failures reject the request before any state is touched.

use alloy_primitives::U256;
use validator::Validate;

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::models::{OrderType, PlaceOrderRequest, TimeInForce};
use crate::precision::{self, Amount, BPS_DENOM};

pub fn validate_request(req: &PlaceOrderRequest, config: &AppConfig) -> Result<(), CoreError> {
    req.validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;

    if req.quantity.is_zero() {
        return Err(CoreError::Validation("quantity must be positive".into()));
    }

    if req.order_type.requires_price() {
        match req.price {
            None => {
                return Err(CoreError::Validation(format!(
                    "{} orders require a price",
                    req.order_type
                )))
            }
            Some(p) if p.is_zero() => {
                return Err(CoreError::Validation("price must be positive".into()))
            }
            _ => {}
        }
    }

    if req.order_type.requires_stop_price() {
        match req.stop_price {
            None => {
                return Err(CoreError::Validation(format!(
                    "{} orders require a stop price",
                    req.order_type
                )))
            }
            Some(p) if p.is_zero() => {
                return Err(CoreError::Validation("stop price must be positive".into()))
            }
            _ => {}
        }
    }

    match req.order_type {
        OrderType::Market | OrderType::PerpetualMarket => {
            if req.price.is_some() {
                return Err(CoreError::Validation("market orders carry no price".into()));
            }
            if req.post_only {
                return Err(CoreError::Validation("market orders cannot be post-only".into()));
            }
        }
        OrderType::Iceberg => {
            let visible = req
                .visible_amount
                .ok_or_else(|| CoreError::Validation("iceberg orders require visible_amount".into()))?;
            if visible.is_zero() || visible > req.quantity {
                return Err(CoreError::Validation(
                    "visible_amount must be positive and at most the total quantity".into(),
                ));
            }
        }
        OrderType::Twap | OrderType::Vwap => {
            let slices = req
                .slices
                .ok_or_else(|| CoreError::Validation("time-sliced orders require slices".into()))?;
            let duration = req
                .duration_secs
                .ok_or_else(|| CoreError::Validation("time-sliced orders require duration_secs".into()))?;
            if slices == 0 || duration == 0 {
                return Err(CoreError::Validation(
                    "slices and duration_secs must be positive".into(),
                ));
            }
            if req.time_in_force == TimeInForce::Ioc || req.time_in_force == TimeInForce::Fok {
                return Err(CoreError::Validation(
                    "time-sliced orders are incompatible with IOC/FOK".into(),
                ));
            }
        }
        OrderType::TrailingStop => {
            let distance = req.trail_distance.ok_or_else(|| {
                CoreError::Validation("trailing stops require trail_distance".into())
            })?;
            if distance.is_zero() {
                return Err(CoreError::Validation("trail_distance must be positive".into()));
            }
        }
        OrderType::Oco => {
            if req.stop_limit_price.map_or(true, |p| p.is_zero()) {
                return Err(CoreError::Validation(
                    "oco orders require a positive stop_limit_price".into(),
                ));
            }
        }
        _ => {}
    }

    if req.order_type.is_perpetual() {
        if req.leverage > config.perp.max_leverage {
            return Err(CoreError::Validation(format!(
                "leverage {} exceeds the maximum {}",
                req.leverage, config.perp.max_leverage
            )));
        }
    } else if req.leverage != 1 {
        return Err(CoreError::Validation("spot orders use leverage 1".into()));
    }

    if req.reduce_only && !req.order_type.is_perpetual() {
        return Err(CoreError::Validation("reduce-only applies to perpetual orders".into()));
    }

    Ok(())
}

/// Reject when an effective price deviates from the last trade by more than
/// the configured band. Orders without an effective price (market-style)
/// pass through.
pub fn check_price_band(
    effective_price: Option<Amount>,
    last_trade: Option<Amount>,
    band_bps: u32,
) -> Result<(), CoreError> {
    let (Some(price), Some(last)) = (effective_price, last_trade) else {
        return Ok(());
    };
    if last.is_zero() {
        return Ok(());
    }
    let diff = if price >= last { price - last } else { last - price };
    let deviation_bps = precision::mul_div(diff.0, U256::from(BPS_DENOM), last.0)
        .map_err(CoreError::from)?;
    if deviation_bps > U256::from(band_bps) {
        return Err(CoreError::Risk(format!(
            "price {} deviates more than {} bps from last trade {}",
            price, band_bps, last
        )));
    }
    Ok(())
}
