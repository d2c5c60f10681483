//! Promotion lifecycle: a temporary price override on an available lot.
//!
//! The promotion owns `Lot::price` while it is active. Status restoration is
//! left to the coordinator like every other controller.

use crate::error::{DomainError, Result};
use crate::types::{Lot, Money, Promotion, PromotionId, Transition};
use chrono::{DateTime, Utc};

/// Input for applying a promotion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPromotion {
    /// Price while the promotion is active
    pub promotional_price: Money,
    /// Optional end; open-ended when `None`
    pub ends_at: Option<DateTime<Utc>>,
    /// Optional explanation
    pub explanation: Option<String>,
}

/// Promotion rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct PromotionLifecycle;

impl PromotionLifecycle {
    /// Create an active promotion and switch the lot to the promotional price.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Validation`] if the promotional price is zero or
    /// not below the current price, or the end is not after `now`.
    pub fn apply(lot: &mut Lot, new: NewPromotion, now: DateTime<Utc>) -> Result<Promotion> {
        if new.promotional_price.is_zero() {
            return Err(DomainError::Validation(
                "promotional price must be greater than zero".to_string(),
            ));
        }
        if new.promotional_price >= lot.price() {
            return Err(DomainError::Validation(format!(
                "promotional price {} must be below the current price {}",
                new.promotional_price,
                lot.price()
            )));
        }
        if new.ends_at.is_some_and(|ends_at| ends_at <= now) {
            return Err(DomainError::Validation(
                "promotion end must be in the future".to_string(),
            ));
        }

        let promotion = Promotion {
            id: PromotionId::new(),
            lot_id: lot.id,
            previous_price: lot.price(),
            promotional_price: new.promotional_price,
            previous_lot_status: lot.status(),
            starts_at: now,
            ends_at: new.ends_at,
            active: true,
            explanation: new.explanation,
        };
        lot.set_price(promotion.promotional_price);
        tracing::info!(
            promotion_id = %promotion.id,
            lot_id = %lot.id,
            previous_price = %promotion.previous_price,
            promotional_price = %promotion.promotional_price,
            "Promotion applied"
        );
        Ok(promotion)
    }

    /// Explicit removal. Restores the previous price.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Conflict`] if the promotion is no longer active.
    pub fn remove(lot: &mut Lot, promotion: &mut Promotion) -> Result<Transition<bool>> {
        if !promotion.active {
            return Err(DomainError::Conflict(format!(
                "promotion {} is not active",
                promotion.id
            )));
        }
        Ok(Self::deactivate(lot, promotion, "removed"))
    }

    /// Close an active promotion because the lot was sold. No-op if inactive.
    pub fn close_for_sale(lot: &mut Lot, promotion: &mut Promotion) -> Option<Transition<bool>> {
        promotion
            .active
            .then(|| Self::deactivate(lot, promotion, "closed by sale"))
    }

    /// Whether the end timestamp elapsed on an active promotion
    #[must_use]
    pub fn is_due(promotion: &Promotion, now: DateTime<Utc>) -> bool {
        promotion.active && promotion.ends_at.is_some_and(|ends_at| now > ends_at)
    }

    /// Lazy expiry check.
    pub fn expire_if_due(
        lot: &mut Lot,
        promotion: &mut Promotion,
        now: DateTime<Utc>,
    ) -> Option<Transition<bool>> {
        Self::is_due(promotion, now).then(|| Self::deactivate(lot, promotion, "ended"))
    }

    fn deactivate(lot: &mut Lot, promotion: &mut Promotion, reason: &'static str) -> Transition<bool> {
        promotion.active = false;
        lot.set_price(promotion.previous_price);
        tracing::info!(
            promotion_id = %promotion.id,
            lot_id = %lot.id,
            price = %promotion.previous_price,
            reason,
            "Promotion deactivated"
        );
        Transition::new(true, false)
    }
}
