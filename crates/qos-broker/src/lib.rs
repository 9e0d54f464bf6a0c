// qos-broker: rules-driven quality-of-service work broker — a worker-pool
// scheduler whose policy (permissions, priorities, global and per-user
// concurrency limits) is a declarative rule set in a small expression
// language.

pub mod broker;
pub mod dispatcher;
pub mod environment;
pub mod expr;
pub mod parser;
pub mod qos;
pub mod request;
pub mod rules;
pub mod types;

pub use broker::Broker;
pub use dispatcher::{BrokerStats, Dispatcher};
pub use environment::{Environment, EnvironmentObserver};
pub use expr::{Builtin, Callable, Context, EvalError, EvalErrorKind, Expr, FunctionRegistry};
pub use parser::{ParseError, RulesParser};
pub use qos::{Properties, QoS, StatusReport};
pub use request::{Job, Request};
pub use rules::{LimitRule, Rule, RuleKind, RuleSet};
pub use types::{BrokerError, JobError, Status, Value};
