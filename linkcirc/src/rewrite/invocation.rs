//! Textual procedure invocations.
//!
//! An invocation is a procedure name followed by a parenthesised list of
//! positional arguments: integers, floats, or single-quoted strings with
//! `''` standing for a literal quote.
//!
//! Parsing follows the `pest` grammar in `invocation.pest`.

use std::fmt;
use std::str::FromStr;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

use super::ProcedureError;

/// A positional argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    Str(String),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Int(i) => write!(f, "{i}"),
            // Debug formatting keeps the decimal point on whole numbers.
            Argument::Float(x) => write!(f, "{x:?}"),
            Argument::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<i64> for Argument {
    fn from(i: i64) -> Self {
        Argument::Int(i)
    }
}

impl From<f64> for Argument {
    fn from(x: f64) -> Self {
        Argument::Float(x)
    }
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Argument::Str(s.to_string())
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Self {
        Argument::Str(s)
    }
}

/// A call of a named procedure with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// The procedure name.
    pub name: String,
    /// The arguments, in order.
    pub args: Vec<Argument>,
}

impl Invocation {
    /// Create an invocation.
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = Argument>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().collect(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> ProcedureError {
        ProcedureError::InvalidInvocation {
            invocation: self.to_string(),
            reason: reason.into(),
        }
    }

    fn arg(&self, index: usize) -> Result<&Argument, ProcedureError> {
        self.args
            .get(index)
            .ok_or_else(|| self.invalid(format!("missing argument {index}")))
    }

    /// An integer argument.
    pub fn int(&self, index: usize) -> Result<i64, ProcedureError> {
        match self.arg(index)? {
            Argument::Int(i) => Ok(*i),
            other => Err(self.invalid(format!("argument {index} ({other}) is not an integer"))),
        }
    }

    /// A non-negative integer argument.
    pub fn count(&self, index: usize) -> Result<usize, ProcedureError> {
        let i = self.int(index)?;
        usize::try_from(i).map_err(|_| self.invalid(format!("argument {index} is negative")))
    }

    /// A numeric argument. Integers are accepted.
    pub fn float(&self, index: usize) -> Result<f64, ProcedureError> {
        match self.arg(index)? {
            Argument::Float(x) => Ok(*x),
            Argument::Int(i) => Ok(*i as f64),
            other => Err(self.invalid(format!("argument {index} ({other}) is not a number"))),
        }
    }

    /// A string argument.
    pub fn str(&self, index: usize) -> Result<&str, ProcedureError> {
        match self.arg(index)? {
            Argument::Str(s) => Ok(s),
            other => Err(self.invalid(format!("argument {index} ({other}) is not a string"))),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

impl FromStr for Invocation {
    type Err = ProcedureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ProcedureError::InvalidInvocation {
            invocation: s.to_string(),
            reason,
        };
        let mut parsed = InvocationParser::parse(Rule::invocation, s)
            .map_err(|e| invalid(e.variant.message().into_owned()))?;
        let mut pairs = parsed
            .next()
            .ok_or_else(|| invalid("empty invocation".to_string()))?
            .into_inner();
        let name = pairs
            .next()
            .filter(|p| p.as_rule() == Rule::name)
            .ok_or_else(|| invalid("missing procedure name".to_string()))?
            .as_str();
        let args = pairs
            .filter(|p| p.as_rule() != Rule::EOI)
            .map(parse_argument)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        Ok(Invocation::new(name, args))
    }
}

#[derive(Parser)]
#[grammar = "rewrite/invocation.pest"]
struct InvocationParser;

/// Parse a match of the `argument` rule.
fn parse_argument(pair: Pair<'_, Rule>) -> Result<Argument, String> {
    let text = pair.as_str();
    match pair.as_rule() {
        Rule::int => text
            .parse()
            .map(Argument::Int)
            .map_err(|e| format!("bad integer {text}: {e}")),
        Rule::float => text
            .parse()
            .map(Argument::Float)
            .map_err(|e| format!("bad float {text}: {e}")),
        Rule::string => {
            let inner = pair.into_inner().next().map_or("", |t| t.as_str());
            Ok(Argument::Str(inner.replace("''", "'")))
        }
        rule => Err(format!("unexpected {rule:?}")),
    }
}
