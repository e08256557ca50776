//! Expression evaluation capability for query filters.

use serde_json::Value;

/// Evaluates filter expressions inside query objects against a context.
///
/// The engine consumes this for query-object filters only; it never runs
/// free-form evaluation over records itself.
pub trait Evaluator {
    /// Evaluates an expression with a context of the shape
    /// `{"context": …, "item": {}}`. Returns the resolved value.
    fn eval(&self, expr: &Value, context: &Value) -> Value;
}

/// Default evaluator: expressions are taken as literal values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralEvaluator;

impl Evaluator for LiteralEvaluator {
    fn eval(&self, expr: &Value, _context: &Value) -> Value {
        expr.clone()
    }
}
