//! Path encoding: one cleaned order's stage events become an ordered state
//! sequence that starts at Start and terminates in exactly one absorbing
//! state.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::errors::AttributionError;
use crate::logging::{log, obj, v_u64, Domain, Level};
use crate::states::State;

/// Terminal outcome recorded for an order by the upstream cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converted,
    Dropped,
}

/// One funnel-stage event. A missing category maps to the configured
/// UNKNOWN token during encoding.
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub stage: String,
    pub category: Option<String>,
}

impl StageEvent {
    pub fn new(stage: &str, category: Option<&str>) -> Self {
        Self {
            stage: stage.to_string(),
            category: category.map(|c| c.to_string()),
        }
    }
}

/// One cleaned order: ordered stage events plus the terminal outcome.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub events: Vec<StageEvent>,
    pub outcome: Outcome,
}

/// Encoded state sequence for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub order_id: String,
    pub states: Vec<State>,
}

impl Path {
    pub fn converted(&self) -> bool {
        self.states.last() == Some(&State::Conversion)
    }
}

/// Diagnostic for an order excluded during encoding.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedOrder {
    pub order_id: String,
    pub reason: String,
}

/// Trimmed category, passed through the configured label mapping, with
/// missing/blank values replaced by the UNKNOWN token. With a non-empty
/// mapping, labels outside it also become UNKNOWN; an empty mapping keeps
/// raw labels as-is.
pub fn normalize_category(raw: Option<&str>, cfg: &Config) -> String {
    let trimmed = match raw {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => return cfg.unknown_category.clone(),
    };
    if cfg.category_mapping.is_empty() {
        return trimmed.to_string();
    }
    cfg.category_mapping
        .get(trimmed)
        .cloned()
        .unwrap_or_else(|| cfg.unknown_category.clone())
}

/// Encode one order. Fails with `PathLength` when the sequence falls outside
/// the configured bounds; the caller decides whether to drop or escalate.
pub fn encode_order(order: &Order, cfg: &Config) -> Result<Path, AttributionError> {
    let mut states = Vec::with_capacity(order.events.len() + 2);
    states.push(State::Start);
    for event in &order.events {
        let category = normalize_category(event.category.as_deref(), cfg);
        states.push(State::touch(&event.stage, &category));
    }
    states.push(match order.outcome {
        Outcome::Converted => State::Conversion,
        Outcome::Dropped => State::Null,
    });

    let len = states.len();
    if len < cfg.min_path_length || len > cfg.max_path_length {
        return Err(AttributionError::PathLength {
            order_id: order.id.clone(),
            len,
            min: cfg.min_path_length,
            max: cfg.max_path_length,
        });
    }

    Ok(Path {
        order_id: order.id.clone(),
        states,
    })
}

/// Encode a batch, excluding out-of-bounds orders with a diagnostic each.
pub fn encode_orders(orders: &[Order], cfg: &Config) -> (Vec<Path>, Vec<DroppedOrder>) {
    let mut paths = Vec::with_capacity(orders.len());
    let mut dropped = Vec::new();
    for order in orders {
        match encode_order(order, cfg) {
            Ok(path) => paths.push(path),
            Err(err) => dropped.push(DroppedOrder {
                order_id: order.id.clone(),
                reason: err.to_string(),
            }),
        }
    }
    log(
        Level::Info,
        Domain::Paths,
        "paths.encoded",
        obj(&[
            ("kept", v_u64(paths.len() as u64)),
            ("dropped", v_u64(dropped.len() as u64)),
        ]),
    );
    (paths, dropped)
}

/// The `n` most frequent category values across all events, most frequent
/// first; ties broken lexicographically for reproducibility.
pub fn top_categories(orders: &[Order], n: usize, cfg: &Config) -> Vec<String> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for order in orders {
        for event in &order.events {
            let cat = normalize_category(event.category.as_deref(), cfg);
            *counts.entry(cat).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(cat, _)| cat).collect()
}

/// Fold every category outside `keep` into the UNKNOWN token. Applied by the
/// caller before encoding when a dimension is capped to its top values.
pub fn fold_categories(orders: &mut [Order], keep: &[String], cfg: &Config) {
    for order in orders.iter_mut() {
        for event in order.events.iter_mut() {
            let cat = normalize_category(event.category.as_deref(), cfg);
            if keep.contains(&cat) {
                event.category = Some(cat);
            } else {
                event.category = Some(cfg.unknown_category.clone());
            }
        }
    }
}
