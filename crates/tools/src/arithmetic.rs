//! Arithmetic tools: `add` and `multiply` over two numbers.
//!
//! Integer inputs produce integer results (`{"result": 8}`), anything else
//! falls back to floating point.

use async_trait::async_trait;
use serde_json::{Value, json};
use steploop_core::error::ToolError;
use steploop_core::shape::{FieldKind, InputShape};
use steploop_core::tool::Tool;

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Multiply,
}

impl Op {
    fn apply_i64(self, a: i64, b: i64) -> Option<i64> {
        match self {
            Op::Add => a.checked_add(b),
            Op::Multiply => a.checked_mul(b),
        }
    }

    fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            Op::Add => a + b,
            Op::Multiply => a * b,
        }
    }
}

fn operands_shape() -> InputShape {
    InputShape::object()
        .field("a", FieldKind::Number)
        .field("b", FieldKind::Number)
}

fn evaluate(tool: &str, op: Op, input: &Value) -> Result<Value, ToolError> {
    let (a, b) = (&input["a"], &input["b"]);

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(result) = op.apply_i64(a, b) {
            return Ok(json!({ "result": result }));
        }
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!({ "result": op.apply_f64(a, b) })),
        _ => Err(ToolError::failed(tool, "both 'a' and 'b' must be numbers")),
    }
}

pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers"
    }

    fn input_shape(&self) -> InputShape {
        operands_shape()
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        evaluate(self.name(), Op::Add, &input)
    }
}

pub struct MultiplyTool;

#[async_trait]
impl Tool for MultiplyTool {
    fn name(&self) -> &str {
        "multiply"
    }

    fn description(&self) -> &str {
        "Multiply two numbers"
    }

    fn input_shape(&self) -> InputShape {
        operands_shape()
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        evaluate(self.name(), Op::Multiply, &input)
    }
}
