//! Expression evaluation for step/task `when` conditions and DAG `depends`.
//!
//! `when` conditions are JEXL, evaluated by `jexl_eval` after `{{...}}`
//! substitution. `depends` expressions are a small boolean language over
//! task outcomes (`A && (B.Failed || !C.Succeeded)`) parsed into a
//! [`DependsExpr`] tree so the DAG resolver can both evaluate it and ask
//! which failure outcomes it explicitly handles.
//!
//! **Security note:** substituted values are passed as context objects when
//! evaluating `when`; the expression text itself only ever contains what the
//! workflow author wrote plus resolved parameter values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Value, json};
use weft_types::node::NodePhase;
use weft_types::workflow::ContinueOn;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("Invalid depends expression '{expression}': {reason}")]
    InvalidDepends { expression: String, reason: String },
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator for `when` conditions.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate a `when` condition.
    ///
    /// Literal `true`/`false` short-circuit; anything else must evaluate to
    /// a boolean.
    pub fn evaluate_when(&self, expression: &str) -> Result<bool, ExpressionError> {
        match expression.trim() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }
        let result = self
            .evaluator
            .eval_in_context(expression, &json!({}))
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;
        match result {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean { result: other }),
        }
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Depends expressions
// ---------------------------------------------------------------------------

/// Outcome selector on a dependency, e.g. the `Failed` in `A.Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    Succeeded,
    Failed,
    Errored,
    Skipped,
    Omitted,
    AnySucceeded,
    AllFailed,
}

impl Selector {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Errored" => Self::Errored,
            "Skipped" => Self::Skipped,
            "Omitted" => Self::Omitted,
            "AnySucceeded" => Self::AnySucceeded,
            "AllFailed" => Self::AllFailed,
            _ => return None,
        })
    }

    /// True when the selector explicitly accepts a `phase` outcome.
    pub fn accepts_failure(self, phase: NodePhase) -> bool {
        match phase {
            NodePhase::Failed => matches!(self, Self::Failed | Self::AllFailed),
            NodePhase::Error => self == Self::Errored,
            _ => false,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Errored => "Errored",
            Self::Skipped => "Skipped",
            Self::Omitted => "Omitted",
            Self::AnySucceeded => "AnySucceeded",
            Self::AllFailed => "AllFailed",
        };
        f.write_str(s)
    }
}

/// Outcome of one dependency as seen by a depends expression.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub phase: Option<NodePhase>,
    /// Phases of expanded children when the task is a loop.
    pub children: Vec<NodePhase>,
}

impl TaskOutcome {
    pub fn matches(&self, selector: Selector) -> bool {
        let Some(phase) = self.phase else {
            return false;
        };
        match selector {
            Selector::Succeeded => phase == NodePhase::Succeeded,
            Selector::Failed => phase == NodePhase::Failed,
            Selector::Errored => phase == NodePhase::Error,
            Selector::Skipped => phase == NodePhase::Skipped,
            Selector::Omitted => phase == NodePhase::Omitted,
            Selector::AnySucceeded if self.children.is_empty() => phase == NodePhase::Succeeded,
            Selector::AnySucceeded => self.children.contains(&NodePhase::Succeeded),
            Selector::AllFailed if self.children.is_empty() => phase == NodePhase::Failed,
            Selector::AllFailed => self.children.iter().all(|p| *p == NodePhase::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependsExpr {
    /// `A` (succeeded or skipped) or `A.<Selector>`.
    Task {
        name: String,
        selector: Option<Selector>,
    },
    Not(Box<DependsExpr>),
    And(Box<DependsExpr>, Box<DependsExpr>),
    Or(Box<DependsExpr>, Box<DependsExpr>),
}

impl DependsExpr {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.or()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Equivalent expression for legacy `dependencies`: every dependency
    /// succeeded or was skipped, or failed/errored under its own `continueOn`.
    pub fn from_dependencies<F>(dependencies: &[String], continue_on: F) -> Option<Self>
    where
        F: Fn(&str) -> ContinueOn,
    {
        dependencies
            .iter()
            .map(|dep| {
                let task = |selector| DependsExpr::Task {
                    name: dep.clone(),
                    selector: Some(selector),
                };
                let on = continue_on(dep);
                let mut clause = DependsExpr::Or(
                    Box::new(task(Selector::Succeeded)),
                    Box::new(task(Selector::Skipped)),
                );
                if on.failed {
                    clause = DependsExpr::Or(Box::new(clause), Box::new(task(Selector::Failed)));
                }
                if on.error {
                    clause = DependsExpr::Or(Box::new(clause), Box::new(task(Selector::Errored)));
                }
                clause
            })
            .reduce(|acc, clause| DependsExpr::And(Box::new(acc), Box::new(clause)))
    }

    /// Task names referenced anywhere in the expression.
    pub fn tasks(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_tasks(&mut out);
        out
    }

    fn collect_tasks<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Task { name, .. } => {
                out.insert(name.as_str());
            }
            Self::Not(inner) => inner.collect_tasks(out),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_tasks(out);
                b.collect_tasks(out);
            }
        }
    }

    /// True when the expression names `task` with a selector that accepts
    /// the failure `phase`, i.e. the author anticipated that outcome.
    pub fn handles(&self, task: &str, phase: NodePhase) -> bool {
        match self {
            Self::Task {
                name,
                selector: Some(selector),
            } => name == task && selector.accepts_failure(phase),
            Self::Task { selector: None, .. } => false,
            Self::Not(inner) => inner.handles(task, phase),
            Self::And(a, b) | Self::Or(a, b) => a.handles(task, phase) || b.handles(task, phase),
        }
    }

    pub fn evaluate<F>(&self, outcome: &F) -> bool
    where
        F: Fn(&str) -> TaskOutcome,
    {
        match self {
            Self::Task {
                name,
                selector: Some(selector),
            } => outcome(name).matches(*selector),
            Self::Task {
                name,
                selector: None,
            } => {
                let o = outcome(name);
                o.matches(Selector::Succeeded) || o.matches(Selector::Skipped)
            }
            Self::Not(inner) => !inner.evaluate(outcome),
            Self::And(a, b) => a.evaluate(outcome) && b.evaluate(outcome),
            Self::Or(a, b) => {
                a.evaluate(outcome) || b.evaluate(outcome) || self.completed_regardless(outcome)
            }
        }
    }

    /// A disjunction naming both `T.Succeeded` and `T.Failed` waits only for
    /// `T` to complete, so an Omitted `T` satisfies it.
    fn completed_regardless<F>(&self, outcome: &F) -> bool
    where
        F: Fn(&str) -> TaskOutcome,
    {
        let mut named = BTreeMap::new();
        self.collect_disjuncts(&mut named);
        named.into_iter().any(|(task, selectors)| {
            selectors.contains(&Selector::Succeeded)
                && selectors.contains(&Selector::Failed)
                && outcome(task).matches(Selector::Omitted)
        })
    }

    fn collect_disjuncts<'a>(&'a self, out: &mut BTreeMap<&'a str, BTreeSet<Selector>>) {
        match self {
            Self::Task {
                name,
                selector: Some(selector),
            } => {
                out.entry(name.as_str()).or_default().insert(*selector);
            }
            Self::Or(a, b) => {
                a.collect_disjuncts(out);
                b.collect_disjuncts(out);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Not,
    And,
    Or,
    Operand(String),
}

fn tokenize(expression: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ExpressionError::InvalidDepends {
                        expression: expression.to_string(),
                        reason: format!("expected '{c}{c}'"),
                    });
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '!' | '&' | '|')
                {
                    i += 1;
                }
                tokens.push(Token::Operand(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> ExpressionError {
        ExpressionError::InvalidDepends {
            expression: self.expression.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or(&mut self) -> Result<DependsExpr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = DependsExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<DependsExpr, ExpressionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = DependsExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<DependsExpr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(DependsExpr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<DependsExpr, ExpressionError> {
        match self.tokens.get(self.pos) {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("missing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Operand(text)) => {
                self.pos += 1;
                Ok(operand(text))
            }
            Some(_) => Err(self.error("expected a task name")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn operand(text: &str) -> DependsExpr {
    if let Some((name, suffix)) = text.rsplit_once('.') {
        if let Some(selector) = Selector::parse(suffix) {
            return DependsExpr::Task {
                name: name.to_string(),
                selector: Some(selector),
            };
        }
    }
    DependsExpr::Task {
        name: text.to_string(),
        selector: None,
    }
}
