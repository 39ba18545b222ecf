use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::{keys, StateStore, StoreError};

pub const DEFAULT_TARGET_MINUTES: u32 = 60;

#[derive(Debug, Error)]
pub enum GoalError {
    #[error("goal {name} already exists")]
    AlreadyExists { name: String },
    #[error("goal {name} not found")]
    NotFound { name: String },
    #[error("goal name must not be empty")]
    EmptyName,
    #[error("target for {name} must be a positive number of minutes")]
    InvalidTarget { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type GoalResult<T> = Result<T, GoalError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub name: String,
    pub target_minutes: u32,
    pub current_seconds: f64,
    pub completed: bool,
}

impl Goal {
    pub fn new(name: impl Into<String>, target_minutes: u32) -> Self {
        Self {
            name: name.into(),
            target_minutes,
            current_seconds: 0.0,
            completed: false,
        }
    }

    pub fn target_seconds(&self) -> f64 {
        f64::from(self.target_minutes) * 60.0
    }

    /// Adds recorded time; returns true when this credit completed the goal.
    pub fn credit(&mut self, seconds: f64) -> bool {
        let was_completed = self.completed;
        self.current_seconds += seconds;
        self.completed = self.current_seconds >= self.target_seconds();
        self.completed && !was_completed
    }

    pub fn debit(&mut self, seconds: f64) {
        self.current_seconds = (self.current_seconds - seconds).max(0.0);
        self.completed = self.current_seconds >= self.target_seconds();
    }

    fn reset(&mut self) {
        self.current_seconds = 0.0;
        self.completed = false;
    }
}

/// Goal list plus the name-only pointer to the active goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSnapshot {
    pub goals: Vec<Goal>,
    pub active_goal: Option<String>,
}

/// A row of an imported goal list. `target` is whatever the source file
/// carried; anything that is not a positive whole number of minutes
/// falls back to [`DEFAULT_TARGET_MINUTES`].
#[derive(Debug, Clone, Deserialize)]
pub struct GoalImportRow {
    pub name: String,
    #[serde(default)]
    pub target: Option<Value>,
}

impl GoalImportRow {
    pub fn target_minutes(&self) -> u32 {
        let parsed = match &self.target {
            Some(Value::Number(number)) => number.as_f64().map(|value| value.trunc() as i64),
            Some(Value::String(raw)) => leading_integer(raw),
            _ => None,
        };
        match parsed {
            Some(value) if value > 0 => u32::try_from(value).unwrap_or(u32::MAX),
            _ => DEFAULT_TARGET_MINUTES,
        }
    }
}

fn leading_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|value| sign * value)
}

pub fn find_goal<'a>(goals: &'a mut [Goal], name: &str) -> Option<&'a mut Goal> {
    goals.iter_mut().find(|goal| goal.name == name)
}

#[derive(Debug, Clone)]
pub struct GoalLedger {
    state: StateStore,
}

impl GoalLedger {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    pub fn list(&self) -> GoalResult<Vec<Goal>> {
        Ok(self.state.get_or(keys::GOALS, Vec::new())?)
    }

    /// The stored pointer, which may dangle.
    pub fn active_name(&self) -> GoalResult<Option<String>> {
        Ok(self.state.get(keys::ACTIVE_GOAL)?)
    }

    /// Resolves the active pointer; a removed goal resolves to `None`.
    pub fn active_goal(&self) -> GoalResult<Option<Goal>> {
        let Some(name) = self.active_name()? else {
            return Ok(None);
        };
        Ok(self.list()?.into_iter().find(|goal| goal.name == name))
    }

    pub fn snapshot(&self) -> GoalResult<GoalSnapshot> {
        let goals = self.list()?;
        let active_goal = self
            .active_name()?
            .filter(|name| goals.iter().any(|goal| &goal.name == name));
        Ok(GoalSnapshot { goals, active_goal })
    }

    pub fn add(&self, name: &str, target_minutes: u32) -> GoalResult<GoalSnapshot> {
        if name.trim().is_empty() {
            return Err(GoalError::EmptyName);
        }
        if target_minutes == 0 {
            return Err(GoalError::InvalidTarget {
                name: name.to_string(),
            });
        }
        {
            let _guard = self.state.write_guard()?;
            let mut goals = self.list()?;
            if goals.iter().any(|goal| goal.name == name) {
                return Err(GoalError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            goals.push(Goal::new(name, target_minutes));
            self.state.put(keys::GOALS, &goals)?;
        }
        self.snapshot()
    }

    pub fn remove(&self, name: &str) -> GoalResult<GoalSnapshot> {
        {
            let _guard = self.state.write_guard()?;
            let mut goals = self.list()?;
            let before = goals.len();
            goals.retain(|goal| goal.name != name);
            if goals.len() == before {
                return Err(GoalError::NotFound {
                    name: name.to_string(),
                });
            }
            self.state.put(keys::GOALS, &goals)?;
            if self.active_name()?.as_deref() == Some(name) {
                self.state.put(keys::ACTIVE_GOAL, &Option::<String>::None)?;
            }
        }
        self.snapshot()
    }

    pub fn set_active(&self, name: &str) -> GoalResult<GoalSnapshot> {
        {
            let _guard = self.state.write_guard()?;
            if !self.list()?.iter().any(|goal| goal.name == name) {
                return Err(GoalError::NotFound {
                    name: name.to_string(),
                });
            }
            self.state.put(keys::ACTIVE_GOAL, name)?;
        }
        self.snapshot()
    }

    pub fn clear_active(&self) -> GoalResult<GoalSnapshot> {
        {
            let _guard = self.state.write_guard()?;
            self.state.put(keys::ACTIVE_GOAL, &Option::<String>::None)?;
        }
        self.snapshot()
    }

    /// Selecting the goal that is already active pauses tracking.
    pub fn toggle_active(&self, name: &str) -> GoalResult<GoalSnapshot> {
        if self.active_name()?.as_deref() == Some(name) {
            self.clear_active()
        } else {
            self.set_active(name)
        }
    }

    /// Zeroes every goal's progress and pauses tracking.
    pub fn reset(&self) -> GoalResult<GoalSnapshot> {
        {
            let _guard = self.state.write_guard()?;
            let mut goals = self.list()?;
            goals.iter_mut().for_each(Goal::reset);
            self.state.put(keys::GOALS, &goals)?;
            self.state.put(keys::ACTIVE_GOAL, &Option::<String>::None)?;
        }
        self.snapshot()
    }

    /// Replaces the whole list. Later duplicates of a name are dropped.
    pub fn import(&self, rows: &[GoalImportRow]) -> GoalResult<GoalSnapshot> {
        let mut goals: Vec<Goal> = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.name.trim();
            if name.is_empty() || goals.iter().any(|goal| goal.name == name) {
                continue;
            }
            goals.push(Goal::new(name, row.target_minutes()));
        }
        {
            let _guard = self.state.write_guard()?;
            self.state.put(keys::GOALS, &goals)?;
            self.state.put(keys::ACTIVE_GOAL, &Option::<String>::None)?;
        }
        self.snapshot()
    }
}
