//! Threshold rules and their fire/rearm state machine.
//!
//! A rule computes a function over the newest value and the cached history,
//! compares the result with its fire value and moves between
//! [`ThresholdState::NotReached`] and [`ThresholdState::Reached`]. Leaving
//! `Reached` requires the rearm condition: the complement of the rule's
//! operation applied to the rearm value (or to the fire value when no rearm
//! value is configured).

use super::cache::ValueCache;
use super::value::{self, DataType, ItemValue, TypedValue};

use regex::Regex;
use serde::Serialize;
use std::iter;

/// Function applied to the sampled values before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckFunction {
    Last,
    Average,
    Deviation,
    Diff,
    Error,
    Sum,
    /// Persisted code this build does not know. Never matches.
    Unknown(i32),
}

impl CheckFunction {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Last,
            1 => Self::Average,
            2 => Self::Deviation,
            3 => Self::Diff,
            4 => Self::Error,
            5 => Self::Sum,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Last => 0,
            Self::Average => 1,
            Self::Deviation => 2,
            Self::Diff => 3,
            Self::Error => 4,
            Self::Sum => 5,
            Self::Unknown(code) => code,
        }
    }
}

/// Comparison between the computed value and a threshold operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Less,
    LessOrEqual,
    Equal,
    GreaterOrEqual,
    Greater,
    NotEqual,
    Like,
    NotLike,
    /// Persisted code this build does not know. Never matches.
    Unknown(i32),
}

impl Operation {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Less,
            1 => Self::LessOrEqual,
            2 => Self::Equal,
            3 => Self::GreaterOrEqual,
            4 => Self::Greater,
            5 => Self::NotEqual,
            6 => Self::Like,
            7 => Self::NotLike,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Less => 0,
            Self::LessOrEqual => 1,
            Self::Equal => 2,
            Self::GreaterOrEqual => 3,
            Self::Greater => 4,
            Self::NotEqual => 5,
            Self::Like => 6,
            Self::NotLike => 7,
            Self::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThresholdState {
    NotReached,
    Reached,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Activated,
    Deactivated,
    AlreadyActive,
    AlreadyInactive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: CheckResult,
    /// Value the comparison ran on, when the function could be computed.
    pub value: Option<TypedValue>,
}

/// A stateful threshold bound to one DCI.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub id: u32,
    pub fire_value: String,
    pub rearm_value: Option<String>,
    pub function: CheckFunction,
    pub operation: Operation,
    pub sample_count: u32,
    pub event_code: u32,
    pub rearm_event_code: u32,
    /// Seconds between repeated fire events while reached; -1 uses the
    /// server default, 0 never repeats.
    pub repeat_interval: i32,
    pub state: ThresholdState,
    pub last_event_timestamp: i64,
    consecutive_matches: u32,
}

impl ThresholdRule {
    pub fn new(id: u32, function: CheckFunction, operation: Operation, fire_value: impl Into<String>) -> Self {
        Self {
            id,
            fire_value: fire_value.into(),
            rearm_value: None,
            function,
            operation,
            sample_count: 1,
            event_code: crate::services::EVENT_THRESHOLD_REACHED,
            rearm_event_code: crate::services::EVENT_THRESHOLD_REARMED,
            repeat_interval: -1,
            state: ThresholdState::NotReached,
            last_event_timestamp: 0,
            consecutive_matches: 0,
        }
    }

    pub fn is_reached(&self) -> bool {
        self.state == ThresholdState::Reached
    }

    /// Cache depth this rule needs behind the newest value.
    pub fn required_cache_depth(&self) -> usize {
        match self.function {
            CheckFunction::Last | CheckFunction::Error | CheckFunction::Unknown(_) => 0,
            CheckFunction::Diff => 1,
            CheckFunction::Average | CheckFunction::Deviation | CheckFunction::Sum => {
                self.sample_count.max(1) as usize
            }
        }
    }

    /// Copy of this rule's definition under a new id, with fresh state.
    pub fn duplicate(&self, id: u32) -> Self {
        Self {
            id,
            state: ThresholdState::NotReached,
            last_event_timestamp: 0,
            consecutive_matches: 0,
            ..self.clone()
        }
    }

    /// Same definition as `other`, values compared as `data_type`.
    pub fn same_definition(&self, other: &ThresholdRule, data_type: DataType) -> bool {
        let same_value = |a: &str, b: &str| {
            ItemValue::new(a, 0).typed(data_type) == ItemValue::new(b, 0).typed(data_type)
        };
        let same_rearm = match (&self.rearm_value, &other.rearm_value) {
            (None, None) => true,
            (Some(a), Some(b)) => same_value(a, b),
            _ => false,
        };
        same_value(&self.fire_value, &other.fire_value)
            && same_rearm
            && self.function == other.function
            && self.operation == other.operation
            && self.sample_count == other.sample_count
            && self.event_code == other.event_code
            && self.rearm_event_code == other.rearm_event_code
            && self.repeat_interval == other.repeat_interval
    }

    /// Compute the rule's function over `current` followed by the cached
    /// samples. Averages and sums use as many samples as are available, up
    /// to `sample_count`.
    pub fn compute(&self, data_type: DataType, current: &ItemValue, cache: &ValueCache) -> Option<TypedValue> {
        let n = self.sample_count.max(1) as usize;
        match self.function {
            CheckFunction::Last => Some(current.typed(data_type)),
            CheckFunction::Diff => cache.head().map(|prev| value::diff(data_type, current, prev)),
            CheckFunction::Average | CheckFunction::Deviation | CheckFunction::Sum => {
                let samples: Vec<&ItemValue> = iter::once(current).chain(cache.samples()).take(n).collect();
                match self.function {
                    CheckFunction::Average => value::average(data_type, &samples),
                    CheckFunction::Deviation => value::mean_deviation(data_type, &samples),
                    _ => value::sum(data_type, &samples),
                }
            }
            CheckFunction::Error | CheckFunction::Unknown(_) => None,
        }
    }

    /// Evaluate against a freshly collected value. Error rules see an error
    /// count of zero, which rearms them.
    pub fn check(&mut self, data_type: DataType, current: &ItemValue, cache: &ValueCache) -> Evaluation {
        if self.function == CheckFunction::Error {
            return self.check_error(0);
        }
        if let CheckFunction::Unknown(code) = self.function {
            tracing::warn!("Threshold {}: unknown check function {}", self.id, code);
            return self.unchanged();
        }
        if let Operation::Unknown(code) = self.operation {
            tracing::warn!("Threshold {}: unknown operation {}", self.id, code);
            return self.unchanged();
        }

        let computed = match self.compute(data_type, current, cache) {
            Some(v) => v,
            None => return self.unchanged(),
        };

        let mut fire = compare(self.operation, &computed, &self.fire_value);
        if self.function == CheckFunction::Last {
            if fire {
                self.consecutive_matches = self.consecutive_matches.saturating_add(1);
                fire = self.consecutive_matches >= self.sample_count.max(1);
            } else {
                self.consecutive_matches = 0;
            }
        }
        let rearm_operand = self.rearm_value.as_deref().unwrap_or(&self.fire_value);
        let rearm = !compare(self.operation, &computed, rearm_operand);

        Evaluation {
            result: self.transition(fire, rearm),
            value: Some(computed),
        }
    }

    /// Evaluate an error rule against the consecutive error count. Other
    /// rules are left untouched.
    pub fn check_error(&mut self, error_count: u32) -> Evaluation {
        if self.function != CheckFunction::Error {
            return self.unchanged();
        }
        let fire = error_count >= self.sample_count.max(1);
        Evaluation {
            result: self.transition(fire, !fire),
            value: None,
        }
    }

    fn transition(&mut self, fire: bool, rearm: bool) -> CheckResult {
        match self.state {
            ThresholdState::NotReached if fire => {
                self.state = ThresholdState::Reached;
                CheckResult::Activated
            }
            ThresholdState::NotReached => CheckResult::AlreadyInactive,
            ThresholdState::Reached if rearm => {
                self.state = ThresholdState::NotReached;
                self.consecutive_matches = 0;
                CheckResult::Deactivated
            }
            ThresholdState::Reached => CheckResult::AlreadyActive,
        }
    }

    fn unchanged(&self) -> Evaluation {
        Evaluation {
            result: if self.is_reached() {
                CheckResult::AlreadyActive
            } else {
                CheckResult::AlreadyInactive
            },
            value: None,
        }
    }

    pub fn effective_repeat_interval(&self, default_interval: u32) -> u32 {
        u32::try_from(self.repeat_interval).unwrap_or(default_interval)
    }

    /// A reached rule should re-send its fire event.
    pub fn repeat_due(&self, now: i64, default_interval: u32) -> bool {
        let interval = self.effective_repeat_interval(default_interval);
        interval != 0 && now - self.last_event_timestamp >= i64::from(interval)
    }

    pub fn mark_last_event(&mut self, now: i64) {
        self.last_event_timestamp = now;
    }

    /// Consecutive matching polls seen by a LAST rule.
    pub fn match_count(&self) -> u32 {
        self.consecutive_matches
    }

    pub fn restore_match_count(&mut self, count: u32) {
        self.consecutive_matches = count;
    }
}

/// Compare `computed` with `operand` parsed as the same type.
///
/// Strings support equality and glob matching only; ordering operations on
/// strings never match.
pub fn compare(operation: Operation, computed: &TypedValue, operand: &str) -> bool {
    let operand_value = ItemValue::new(operand, 0);
    let operand = match computed {
        TypedValue::Int32(_) => operand_value.typed(DataType::Int32),
        TypedValue::UInt32(_) => operand_value.typed(DataType::UInt32),
        TypedValue::Int64(_) => operand_value.typed(DataType::Int64),
        TypedValue::UInt64(_) => operand_value.typed(DataType::UInt64),
        TypedValue::Float(_) => operand_value.typed(DataType::Float),
        TypedValue::String(_) => operand_value.typed(DataType::String),
    };

    if let (TypedValue::String(text), TypedValue::String(pattern)) = (computed, &operand) {
        return match operation {
            Operation::Equal => text == pattern,
            Operation::NotEqual => text != pattern,
            Operation::Like => glob_match(pattern, text),
            Operation::NotLike => !glob_match(pattern, text),
            _ => false,
        };
    }

    match operation {
        Operation::Less => *computed < operand,
        Operation::LessOrEqual => *computed <= operand,
        Operation::Equal => *computed == operand,
        Operation::GreaterOrEqual => *computed >= operand,
        Operation::Greater => *computed > operand,
        Operation::NotEqual => *computed != operand,
        Operation::Like | Operation::NotLike | Operation::Unknown(_) => false,
    }
}

/// Case-sensitive glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut re = String::from("(?s)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(text)).unwrap_or(false)
}
