//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `packet_ledger_packets_created_total` - Packets created
//! - `packet_ledger_claims_total` - Successful claims
//! - `packet_ledger_claim_rejections_total{reason}` - Failed claims by reason
//! - `packet_ledger_refunds_total` - Successful refunds
//! - `packet_ledger_value_claimed` - Units paid out to claimants
//! - `packet_ledger_events_total` - Events appended to the log

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
///
/// Each instance owns its registry so several ledgers can live in one
/// process (tests, embedded use) without colliding in the global registry.
#[derive(Clone)]
pub struct Metrics {
    /// Packets created
    pub packets_created: IntCounter,

    /// Successful claims
    pub claims: IntCounter,

    /// Failed claims by reason
    pub claim_rejections: IntCounterVec,

    /// Successful refunds
    pub refunds: IntCounter,

    /// Units paid out to claimants (truncated to u64)
    pub value_claimed: IntCounter,

    /// Events appended
    pub events: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let packets_created = IntCounter::new(
            "packet_ledger_packets_created_total",
            "Total number of packets created",
        )?;
        registry.register(Box::new(packets_created.clone()))?;

        let claims = IntCounter::new(
            "packet_ledger_claims_total",
            "Total number of successful claims",
        )?;
        registry.register(Box::new(claims.clone()))?;

        let claim_rejections = IntCounterVec::new(
            Opts::new(
                "packet_ledger_claim_rejections_total",
                "Failed claims by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(claim_rejections.clone()))?;

        let refunds = IntCounter::new(
            "packet_ledger_refunds_total",
            "Total number of refunds",
        )?;
        registry.register(Box::new(refunds.clone()))?;

        let value_claimed = IntCounter::new(
            "packet_ledger_value_claimed",
            "Units paid out to claimants",
        )?;
        registry.register(Box::new(value_claimed.clone()))?;

        let events = IntCounter::new(
            "packet_ledger_events_total",
            "Total number of events appended",
        )?;
        registry.register(Box::new(events.clone()))?;

        Ok(Self {
            packets_created,
            claims,
            claim_rejections,
            refunds,
            value_claimed,
            events,
            registry,
        })
    }

    /// Record packet creation
    pub fn record_packet_created(&self) {
        self.packets_created.inc();
    }

    /// Record a successful claim
    pub fn record_claim(&self, amount: u128) {
        self.claims.inc();
        self.value_claimed
            .inc_by(u64::try_from(amount).unwrap_or(u64::MAX));
    }

    /// Record a failed claim
    pub fn record_claim_rejected(&self, reason: &str) {
        self.claim_rejections.with_label_values(&[reason]).inc();
    }

    /// Record a refund
    pub fn record_refund(&self) {
        self.refunds.inc();
    }

    /// Record appended events
    pub fn record_events(&self, count: usize) {
        self.events.inc_by(count as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
