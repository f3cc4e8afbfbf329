//! Iceberg reserves and TWAP/VWAP parent decomposition.
//!
//! Iceberg orders show only their visible tranche in the ladder; the hidden
//! reserve lives here and a fresh slice is released to the back of the
//! price level's FIFO queue when the visible part is consumed.
//!
//! TWAP/VWAP parents never enter the ladder. They are decomposed at arrival
//! into child orders released on a wall-clock schedule by the shared timer
//! wheel; a VWAP parent additionally biases each slice by the volume
//! observed in the previous interval.

use alloy_primitives::U256;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Order, OrderType};
use crate::precision::{self, Amount, BPS_DENOM};

/// Hidden iceberg reserve for one resting order.
#[derive(Debug, Clone)]
pub struct IcebergReserve {
    pub visible: Amount,
    pub reserve: Amount,
}

/// Schedule state of one TWAP/VWAP parent.
#[derive(Debug, Clone)]
pub struct SliceParent {
    pub parent_id: Uuid,
    pub vwap: bool,
    pub slices_total: u32,
    pub slices_released: u32,
    pub interval_ms: i64,
    /// Quantity not yet handed to a child.
    pub undistributed: Amount,
    /// Volume observed on the pair during the current interval.
    pub window_volume: Amount,
    /// Volume observed during the previous interval, used by the VWAP bias.
    pub prev_window_volume: Amount,
}

impl SliceParent {
    pub fn from_order(order: &Order) -> Result<Self, CoreError> {
        let slices = order
            .slices
            .ok_or_else(|| CoreError::Validation("sliced parent without slice count".into()))?;
        let duration = order
            .duration_ms
            .ok_or_else(|| CoreError::Validation("sliced parent without duration".into()))?;
        Ok(SliceParent {
            parent_id: order.id,
            vwap: order.order_type == OrderType::Vwap,
            slices_total: slices,
            slices_released: 0,
            interval_ms: (duration / slices as i64).max(1),
            undistributed: order.quantity,
            window_volume: Amount::ZERO,
            prev_window_volume: Amount::ZERO,
        })
    }

    pub fn done_releasing(&self) -> bool {
        self.slices_released >= self.slices_total || self.undistributed.is_zero()
    }

    /// Quantity of the next child slice.
    ///
    /// TWAP: an even split of what remains undistributed. VWAP: the even
    /// split scaled up by up to 2x in proportion to the volume observed in
    /// the previous interval (relative to the undistributed quantity), with
    /// the even split as the floor when no volume was seen.
    pub fn next_slice(&mut self) -> Result<Amount, CoreError> {
        if self.done_releasing() {
            return Ok(Amount::ZERO);
        }
        // Rotate the observation window at release time.
        self.prev_window_volume = self.window_volume;
        self.window_volume = Amount::ZERO;

        let slices_left = self.slices_total - self.slices_released;
        let even = if slices_left <= 1 {
            self.undistributed
        } else {
            Amount(self.undistributed.0 / U256::from(slices_left))
        };

        let mut slice = even;
        if self.vwap && !self.prev_window_volume.is_zero() && !self.undistributed.is_zero() {
            let vol_bps = precision::mul_div(
                self.prev_window_volume.0,
                U256::from(BPS_DENOM),
                self.undistributed.0,
            )?;
            let capped: u64 = if vol_bps > U256::from(BPS_DENOM) {
                BPS_DENOM
            } else {
                vol_bps.to::<u64>()
            };
            let weight_bps = (BPS_DENOM + capped) as u32;
            slice = precision::fee(even, weight_bps)?;
        }

        let slice = slice
            .max(Amount(U256::from(1u64)))
            .min(self.undistributed);

        self.slices_released += 1;
        self.undistributed -= slice;
        Ok(slice)
    }

    pub fn observe_volume(&mut self, quantity: Amount) {
        self.window_volume = self.window_volume.saturating_add(quantity);
    }
}

/// Per-pair slicer state owned by the pair worker.
#[derive(Debug, Default)]
pub struct SlicerState {
    icebergs: HashMap<Uuid, IcebergReserve>,
    parents: HashMap<Uuid, SliceParent>,
}

impl SlicerState {
    pub fn new() -> Self {
        SlicerState::default()
    }

    // ==================== Iceberg ====================

    pub fn track_iceberg(&mut self, order_id: Uuid, visible: Amount, total: Amount) {
        self.icebergs.insert(
            order_id,
            IcebergReserve {
                visible,
                reserve: total.saturating_sub(visible),
            },
        );
    }

    pub fn is_iceberg(&self, order_id: &Uuid) -> bool {
        self.icebergs.contains_key(order_id)
    }

    /// A visible slice was fully consumed: release the next one, up to
    /// `visible`, or drop the tracking entry when the reserve is empty.
    pub fn refill_iceberg(&mut self, order_id: &Uuid) -> Option<Amount> {
        let entry = self.icebergs.get_mut(order_id)?;
        if entry.reserve.is_zero() {
            self.icebergs.remove(order_id);
            return None;
        }
        let slice = entry.visible.min(entry.reserve);
        entry.reserve -= slice;
        Some(slice)
    }

    pub fn drop_iceberg(&mut self, order_id: &Uuid) {
        self.icebergs.remove(order_id);
    }

    // ==================== TWAP / VWAP parents ====================

    pub fn track_parent(&mut self, parent: SliceParent) {
        self.parents.insert(parent.parent_id, parent);
    }

    pub fn parent_mut(&mut self, parent_id: &Uuid) -> Option<&mut SliceParent> {
        self.parents.get_mut(parent_id)
    }

    pub fn drop_parent(&mut self, parent_id: &Uuid) {
        self.parents.remove(parent_id);
    }

    /// Feed observed pair volume into every live VWAP window.
    pub fn observe_volume(&mut self, quantity: Amount) {
        for parent in self.parents.values_mut() {
            parent.observe_volume(quantity);
        }
    }
}
