//! Attribution run over a CSV of funnel events, one event per line.
//!
//! Input columns: order_id,stage,category,outcome. Events for the same
//! order must be contiguous and in funnel order; `category` may be empty;
//! `outcome` is `converted` or `dropped` and must agree across the order's
//! lines. The full run is printed as JSON on stdout.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use funnelfx::paths::{fold_categories, top_categories};
use funnelfx::{analyze, Config, DimensionSpec, Order, Outcome, StageEvent, Target};

fn parse_line(line: &str) -> Result<(String, String, Option<String>, Outcome)> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 4 {
        return Err(anyhow!("need 4 columns: order_id,stage,category,outcome"));
    }
    let category = match parts[2].trim() {
        "" => None,
        c => Some(c.to_string()),
    };
    let outcome = match parts[3].trim() {
        "converted" => Outcome::Converted,
        "dropped" => Outcome::Dropped,
        other => return Err(anyhow!("unknown outcome {:?}", other)),
    };
    Ok((
        parts[0].trim().to_string(),
        parts[1].trim().to_string(),
        category,
        outcome,
    ))
}

fn load_orders(path: &str) -> Result<Vec<Order>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut orders: Vec<Order> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        if line.starts_with("order_id") || line.is_empty() {
            continue; // skip header
        }
        let (id, stage, category, outcome) = parse_line(&line)?;
        let pos = match index.get(&id) {
            Some(&pos) => pos,
            None => {
                index.insert(id.clone(), orders.len());
                orders.push(Order {
                    id,
                    events: Vec::new(),
                    outcome,
                });
                orders.len() - 1
            }
        };
        if orders[pos].outcome != outcome {
            return Err(anyhow!("order {} has conflicting outcomes", orders[pos].id));
        }
        orders[pos].events.push(StageEvent {
            stage,
            category,
        });
    }
    Ok(orders)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: attribution_run <events_csv>");
        std::process::exit(1);
    }

    let cfg = Config::from_env();
    cfg.validate()?;

    let mut orders = load_orders(&args[1])?;
    if orders.is_empty() {
        return Err(anyhow!("no orders in {}", args[1]));
    }

    // TOP_CATEGORIES caps the attribution dimension to the n most frequent
    // values; the rest fold into the UNKNOWN token before encoding.
    let cap: usize = std::env::var("TOP_CATEGORIES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let values = if cap > 0 {
        let keep = top_categories(&orders, cap, &cfg);
        fold_categories(&mut orders, &keep, &cfg);
        keep
    } else {
        top_categories(&orders, usize::MAX, &cfg)
    };

    let dimension = DimensionSpec {
        name: "category".to_string(),
        targets: values.into_iter().map(Target::Category).collect(),
    };

    let run = analyze(&orders, &[dimension], &cfg)?;
    println!("{}", run.to_json());
    Ok(())
}
