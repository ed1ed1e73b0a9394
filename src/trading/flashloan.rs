//! Flashloan terms and operator collateral
//!
//! A `LoanRequest` can only be built inside this module tree, and only the
//! atomic unit holds one. Collateral is the operator's own balance, split
//! between in-flight units.

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pump::price::bps_ceil;

/// Loan terms for one atomic unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanRequest {
    principal: u64,
    collateral: u64,
    borrower: Pubkey,
    fee: u64,
}

impl LoanRequest {
    pub(in crate::trading) fn new(
        principal: u64,
        collateral: u64,
        borrower: Pubkey,
        loan_fee_bps: u32,
    ) -> Self {
        Self {
            principal,
            collateral,
            borrower,
            fee: bps_ceil(principal, loan_fee_bps),
        }
    }

    pub fn principal(&self) -> u64 {
        self.principal
    }

    pub fn collateral(&self) -> u64 {
        self.collateral
    }

    pub fn borrower(&self) -> &Pubkey {
        &self.borrower
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// What the repay step must return
    pub fn repay_total(&self) -> u64 {
        self.principal.saturating_add(self.fee)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    total: u64,
    reserved: u64,
    reservations: usize,
}

/// Operator balance partitioned between in-flight units
#[derive(Debug, Clone, Default)]
pub struct CollateralPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl CollateralPool {
    pub fn new(total: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                total,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `amount` for one unit; released when the reservation drops
    pub fn reserve(&self, amount: u64) -> Result<CollateralReservation> {
        let mut inner = self.lock();
        let available = inner.total.saturating_sub(inner.reserved);
        if amount > available {
            return Err(Error::InsufficientCollateral {
                available,
                required: amount,
            });
        }
        inner.reserved += amount;
        inner.reservations += 1;
        debug!(amount, reserved = inner.reserved, "Collateral reserved");

        Ok(CollateralReservation {
            pool: Arc::clone(&self.inner),
            amount,
        })
    }

    pub fn available(&self) -> u64 {
        let inner = self.lock();
        inner.total.saturating_sub(inner.reserved)
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn in_flight(&self) -> usize {
        self.lock().reservations
    }

    /// Apply a settled balance change
    pub fn apply_delta(&self, delta: i128) {
        let mut inner = self.lock();
        let next = (inner.total as i128 + delta).clamp(0, u64::MAX as i128);
        inner.total = next as u64;
    }
}

/// A unit's share of collateral
#[derive(Debug)]
pub struct CollateralReservation {
    pool: Arc<Mutex<PoolInner>>,
    amount: u64,
}

impl CollateralReservation {
    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for CollateralReservation {
    fn drop(&mut self) {
        let mut inner = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        inner.reserved = inner.reserved.saturating_sub(self.amount);
        inner.reservations = inner.reservations.saturating_sub(1);
    }
}
