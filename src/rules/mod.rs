//! Alert rules: expression language, evaluation and rule definitions

pub mod duration;
pub mod eval;
pub mod expr;
pub mod matcher;
pub mod rule;

pub use duration::{duration_millis, format_duration, parse_duration, DurationError};
pub use eval::{Element, EvalContext, DEFAULT_LOOKBACK};
pub use expr::{
    parse_expr, parse_matcher, AggregateOp, AlertExpr, CompareOp, ExprError, RangeFunc, Selector,
    VectorExpr,
};
pub use matcher::{matches_all, LabelMatcher, MatchOp};
pub use rule::AlertRule;
