//! Order lookup tool with a randomized body.
//!
//! Each call returns one of two canned orders at random, so the same input
//! can yield different outputs across steps. Runs that wait for a specific
//! order have to keep re-evaluating their stop conditions after every step.
//! Seed the tool for reproducible sequences.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Mutex;
use steploop_core::error::ToolError;
use steploop_core::shape::{FieldKind, InputShape};
use steploop_core::tool::{Tool, ToolDefinition};

pub const FIND_ORDERS: &str = "findOrders";

/// Probability that a call returns the chair order.
const DEFAULT_CHAIR_PROBABILITY: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
struct Order {
    id: &'static str,
    product: &'static str,
}

static ORDERS: [Order; 2] = [
    Order {
        id: "1234",
        product: "Chair",
    },
    Order {
        id: "6789",
        product: "Table",
    },
];

/// Input shape shared by the executable and deferred variants.
pub fn find_orders_shape() -> InputShape {
    InputShape::object()
        .field("userId", FieldKind::String)
        .with_default("limit", FieldKind::Number, json!(3))
        .describe("Maximum number of orders to return")
}

/// `findOrders` declared without a body: calls are handed back to the caller.
pub fn deferred_find_orders() -> ToolDefinition {
    ToolDefinition::new(FIND_ORDERS, "Find orders for a user", find_orders_shape())
}

pub struct FindOrdersTool {
    rng: Mutex<StdRng>,
    chair_probability: f64,
}

impl FindOrdersTool {
    /// Create the tool; `None` seeds from entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            chair_probability: DEFAULT_CHAIR_PROBABILITY,
        }
    }

    /// Override the chance of returning the chair order (clamped to 0..=1).
    pub fn with_chair_probability(mut self, p: f64) -> Self {
        self.chair_probability = p.clamp(0.0, 1.0);
        self
    }

    fn pick(&self) -> &'static Order {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if rng.gen_bool(self.chair_probability) {
            &ORDERS[0]
        } else {
            &ORDERS[1]
        }
    }
}

#[async_trait]
impl Tool for FindOrdersTool {
    fn name(&self) -> &str {
        FIND_ORDERS
    }

    fn description(&self) -> &str {
        "Find orders for a user"
    }

    fn input_shape(&self) -> InputShape {
        find_orders_shape()
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let user_id = input["userId"].as_str().unwrap_or_default();
        let order = self.pick();
        tracing::debug!(user_id, order = order.id, "findOrders picked order");
        Ok(json!([order]))
    }
}
