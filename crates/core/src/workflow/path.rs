//! Resolution of step inputs against the results recorded in a run.
//!
//! A ref path starts with a step id, continues with `output` or `error` and
//! then walks into the recorded value, e.g. `fetch_org.output.members[0].id`.
//! The reserved root `trigger` addresses the run input instead
//! (`trigger.orgId`).

use crate::error::{WorkflowError, WorkflowResult};
use crate::types::{InputValue, SerializedError, StepState, StepStatus};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Root segment that addresses the run input.
pub const TRIGGER_ROOT: &str = "trigger";

/// One parsed piece of a ref path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Property(String),
    Index(usize),
}

/// Recorded result of a completed step
#[derive(Debug, Clone, Default)]
pub struct CompletedStep {
    pub output: Option<Value>,
    pub error: Option<SerializedError>,
}

/// Everything a ref can point at
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub completed: HashMap<String, CompletedStep>,
    pub trigger_input: Value,
}

impl ResolutionContext {
    pub fn new(trigger_input: Value) -> Self {
        Self {
            completed: HashMap::new(),
            trigger_input,
        }
    }

    /// Build a context from the persisted steps of a run; only succeeded and
    /// failed steps are addressable.
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a StepState>, trigger_input: Value) -> Self {
        let mut context = Self::new(trigger_input);
        for step in steps {
            match step.status {
                StepStatus::Succeeded => {
                    context.complete(
                        step.step_id.clone(),
                        step.result.clone().unwrap_or(Value::Null),
                    );
                }
                StepStatus::Failed => {
                    context.completed.insert(
                        step.step_id.clone(),
                        CompletedStep {
                            output: None,
                            error: step.error.clone(),
                        },
                    );
                }
                _ => {}
            }
        }
        context
    }

    pub fn complete(&mut self, step_id: impl Into<String>, output: Value) {
        self.completed.insert(
            step_id.into(),
            CompletedStep {
                output: Some(output),
                error: None,
            },
        );
    }
}

/// Outcome of a static path check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValidation {
    pub valid: bool,
    pub error: Option<String>,
}

/// Split a path into property and index segments.
pub fn parse_path(path: &str) -> WorkflowResult<Vec<PathSegment>> {
    if path.trim().is_empty() {
        return Err(WorkflowError::invalid_path(path, "path is empty"));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut expect_property = true;
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && expect_property {
                    return Err(WorkflowError::invalid_path(path, "empty path segment"));
                }
                if !current.is_empty() {
                    segments.push(PathSegment::Property(std::mem::take(&mut current)));
                }
                expect_property = true;
                if chars.peek().is_none() {
                    return Err(WorkflowError::invalid_path(path, "path ends with '.'"));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Property(std::mem::take(&mut current)));
                } else if expect_property {
                    return Err(WorkflowError::invalid_path(
                        path,
                        "index must follow a property",
                    ));
                }

                let mut raw = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '[' => {
                            return Err(WorkflowError::invalid_path(path, "unbalanced brackets"));
                        }
                        c => raw.push(c),
                    }
                }
                if !closed {
                    return Err(WorkflowError::invalid_path(path, "unbalanced brackets"));
                }

                let raw = raw.trim();
                let index = raw.parse::<usize>().map_err(|_| {
                    WorkflowError::invalid_path(path, format!("non-numeric index '{}'", raw))
                })?;
                segments.push(PathSegment::Index(index));
                expect_property = false;

                match chars.peek() {
                    None | Some('.') | Some('[') => {}
                    Some(other) => {
                        return Err(WorkflowError::invalid_path(
                            path,
                            format!("unexpected '{}' after index", other),
                        ));
                    }
                }
            }
            ']' => return Err(WorkflowError::invalid_path(path, "unbalanced brackets")),
            c => {
                current.push(c);
                expect_property = false;
            }
        }
    }

    if !current.is_empty() {
        segments.push(PathSegment::Property(current));
    }

    Ok(segments)
}

/// Check that `path` is a well-formed ref without needing a run.
pub fn validate_path(path: &str) -> PathValidation {
    match check_ref_shape(path) {
        Ok(()) => PathValidation {
            valid: true,
            error: None,
        },
        Err(e) => PathValidation {
            valid: false,
            error: Some(e.to_string()),
        },
    }
}

fn check_ref_shape(path: &str) -> WorkflowResult<()> {
    let segments = parse_path(path)?;
    let root = root_step_id(path, &segments)?;
    if root == TRIGGER_ROOT {
        return Ok(());
    }
    result_kind(path, &segments).map(|_| ())
}

fn root_step_id<'a>(path: &str, segments: &'a [PathSegment]) -> WorkflowResult<&'a str> {
    match segments.first() {
        Some(PathSegment::Property(step_id)) => Ok(step_id),
        _ => Err(WorkflowError::invalid_path(path, "path must start with a step id")),
    }
}

enum ResultKind {
    Output,
    Error,
}

fn result_kind(path: &str, segments: &[PathSegment]) -> WorkflowResult<ResultKind> {
    match segments.get(1) {
        Some(PathSegment::Property(p)) if p == "output" => Ok(ResultKind::Output),
        Some(PathSegment::Property(p)) if p == "error" => Ok(ResultKind::Error),
        _ => Err(WorkflowError::invalid_path(
            path,
            "expected 'output' or 'error' after the step id",
        )),
    }
}

/// Resolve a single input. `Ok(None)` means the path walked off the recorded
/// value, which is not an error.
pub fn resolve_input_value(
    input: &InputValue,
    context: &ResolutionContext,
) -> WorkflowResult<Option<Value>> {
    let path = match input {
        InputValue::Literal { value } => return Ok(Some(value.clone())),
        InputValue::Ref { path } => path,
    };

    let segments = parse_path(path)?;
    let step_id = root_step_id(path, &segments)?;

    let Some(completed) = context.completed.get(step_id) else {
        if step_id == TRIGGER_ROOT {
            return Ok(traverse(&context.trigger_input, &segments[1..]));
        }
        return Err(WorkflowError::UnresolvedReference {
            path: path.clone(),
            step_id: step_id.to_string(),
        });
    };

    let base = match result_kind(path, &segments)? {
        ResultKind::Output => completed.output.clone(),
        ResultKind::Error => completed
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
    };

    Ok(base.and_then(|value| traverse(&value, &segments[2..])))
}

/// Resolve every input of a node; inputs that resolve to nothing are left out.
pub fn resolve_inputs(
    inputs: &BTreeMap<String, InputValue>,
    context: &ResolutionContext,
) -> WorkflowResult<Map<String, Value>> {
    let mut resolved = Map::new();
    for (name, input) in inputs {
        if let Some(value) = resolve_input_value(input, context)? {
            resolved.insert(name.clone(), value);
        }
    }
    Ok(resolved)
}

fn traverse(value: &Value, segments: &[PathSegment]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match segment {
            PathSegment::Property(key) => current.as_object()?.get(key)?,
            PathSegment::Index(index) => current.as_array()?.get(*index)?,
        };
    }
    Some(current.clone())
}
